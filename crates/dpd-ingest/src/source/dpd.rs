//! Health Canada Drug Product Database HTML client
//!
//! Listing pages come from the "fast search" results endpoint, paged with
//! `results_page`. Each listing row links to a product information page laid
//! out as label/value rows (`div.row` with `p.col-sm-4 strong` as the label
//! and `p.col-sm-8` as the value).

use super::{classify_status, describe_transport, ListingPage, SourceClient};
use crate::retry::Attempt;
use crate::types::{Fields, ItemReference, ListingEntry};
use async_trait::async_trait;
use dpd_common::text::collapse_whitespace;
use regex::Regex;
use reqwest::{header, Client, Url};
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tracing::{debug, warn};

// ============================================================================
// DPD Constants
// ============================================================================

pub const DPD_BASE_URL: &str = "https://health-products.canada.ca";

const RESULTS_PATH: &str = "/dpd-bdpp/search-fast-recherche-rapide";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; dpd-ingest/0.1)";

pub const BIOSIMILAR_COLUMN: &str = "Biosimilar Biologic Drug";

/// Every column a DPD record carries once listing and detail are merged
pub const DPD_COLUMNS: [&str; 28] = [
    "Status",
    "DIN URL",
    "DIN",
    "Company",
    "Product",
    "Class",
    "PM See footnote1",
    "Schedule",
    "# See footnote2",
    "A.I. name See footnote3",
    "Strength",
    "Current status date",
    "Original market date",
    "Address",
    "City",
    "state",
    "Country",
    "Zipcode",
    "Number of active ingredient(s)",
    BIOSIMILAR_COLUMN,
    "American Hospital Formulary Service (AHFS)",
    "Anatomical Therapeutic Chemical (ATC)",
    "Active ingredient group (AIG) number",
    "Labelling",
    "Product Monograph/Veterinary Date",
    "List of active ingredient",
    "Dosage form",
    "Route(s) of administration",
];

/// Listing table columns in cell order; the DIN URL comes from the link in
/// the DIN cell
const LISTING_CELLS: [&str; 10] = [
    "Status",
    "DIN",
    "Company",
    "Product",
    "Class",
    "PM See footnote1",
    "Schedule",
    "# See footnote2",
    "A.I. name See footnote3",
    "Strength",
];

/// Detail columns read from a label/value row whose label contains the
/// given lowercase needle
const DETAIL_LABELS: [(&str, &str); 10] = [
    ("Current status date", "current status date"),
    ("Original market date", "original market date"),
    ("Class", "class:"),
    ("Dosage form", "dosage form"),
    ("Route(s) of administration", "route(s) of administration"),
    ("Number of active ingredient(s)", "number of active ingredient"),
    ("Schedule", "schedule"),
    (
        "American Hospital Formulary Service (AHFS)",
        "american hospital formulary service",
    ),
    (
        "Anatomical Therapeutic Chemical (ATC)",
        "anatomical therapeutic chemical",
    ),
    ("Active ingredient group (AIG) number", "active ingredient group"),
];

const COMPANY_SPANS: [&str; 5] = ["Address", "City", "state", "Country", "Zipcode"];

// ============================================================================
// Page Parser
// ============================================================================

/// Compiled selectors and patterns for DPD pages
pub struct DpdPageParser {
    base: Url,
    results_table: Selector,
    body_rows: Selector,
    cells: Selector,
    link: Selector,
    detail_rows: Selector,
    label: Selector,
    value: Selector,
    company_link: Selector,
    spans: Selector,
    pdf_link: Selector,
    tables: Selector,
    caption: Selector,
    table_rows: Selector,
    total_entries: Regex,
    iso_date: Regex,
}

fn compile(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("invalid selector '{css}': {e}"))
}

fn text_of(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

impl DpdPageParser {
    pub fn new(base_url: &str) -> Result<Self, String> {
        let base = Url::parse(base_url).map_err(|e| format!("invalid base URL '{base_url}': {e}"))?;
        Ok(Self {
            base,
            results_table: compile("table#results")?,
            body_rows: compile("tbody tr")?,
            cells: compile("td")?,
            link: compile("a[href]")?,
            detail_rows: compile("div.row")?,
            label: compile("p.col-sm-4 strong")?,
            value: compile("p.col-sm-8")?,
            company_link: compile("a#company")?,
            spans: compile("span")?,
            pdf_link: compile(r#"a[href$=".PDF"], a[href$=".pdf"]"#)?,
            tables: compile("table")?,
            caption: compile("caption")?,
            table_rows: compile("tr")?,
            total_entries: Regex::new(
                r"(?i)(?:of|sur)\s+([0-9][0-9\s,.]*)\s+(?:entries|entrées)",
            )
            .map_err(|e| e.to_string())?,
            iso_date: Regex::new(r"\b(?:19|20)\d{2}-\d{2}-\d{2}\b").map_err(|e| e.to_string())?,
        })
    }

    fn resolve(&self, href: &str) -> String {
        self.base
            .join(href)
            .map(|url| url.to_string())
            .unwrap_or_default()
    }

    fn total_entries(&self, html: &str) -> Option<u64> {
        let captures = self.total_entries.captures(html)?;
        let digits: String = captures
            .get(1)?
            .as_str()
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        digits.parse().ok()
    }

    /// Parse a results page.
    ///
    /// `Err` means the page did not contain the results table at all.
    pub fn parse_listing(&self, html: &str) -> Result<ListingPage, String> {
        let document = Html::parse_document(html);
        let Some(table) = document.select(&self.results_table).next() else {
            return Err("results table not found; listing layout may have changed".to_string());
        };

        let mut entries = Vec::new();
        for row in table.select(&self.body_rows) {
            let cells: Vec<ElementRef<'_>> = row.select(&self.cells).collect();
            if cells.len() < LISTING_CELLS.len() {
                continue;
            }

            let mut fields = Fields::new();
            for (column, cell) in LISTING_CELLS.iter().zip(&cells) {
                fields.insert((*column).to_string(), text_of(*cell));
            }
            let detail_url = cells[1]
                .select(&self.link)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(|href| self.resolve(href))
                .unwrap_or_default();
            fields.insert("DIN URL".to_string(), detail_url.clone());

            entries.push(ListingEntry {
                natural_key: fields.get("DIN").cloned().unwrap_or_default(),
                source_id: detail_url,
                fields,
            });
        }

        Ok(ListingPage {
            entries,
            total: self.total_entries(html),
        })
    }

    /// Parse a product information page into detail columns
    pub fn parse_detail(&self, html: &str) -> Result<Fields, String> {
        let document = Html::parse_document(html);

        let rows: Vec<(String, ElementRef<'_>)> = document
            .select(&self.detail_rows)
            .filter_map(|row| {
                let label = row.select(&self.label).next()?;
                let value = row.select(&self.value).next()?;
                Some((text_of(label).to_lowercase(), value))
            })
            .collect();
        if rows.is_empty() {
            return Err("no label/value rows on product page".to_string());
        }
        let find = |needle: &str| rows.iter().find(|(label, _)| label.contains(needle)).map(|(_, v)| *v);

        let mut fields = Fields::new();
        for (column, needle) in DETAIL_LABELS {
            let value = find(needle).map(text_of).unwrap_or_default();
            fields.insert(column.to_string(), value);
        }

        if let Some(company) = find("company") {
            if let Some(name) = company.select(&self.company_link).next() {
                fields.insert("Company".to_string(), text_of(name));
            }
            let spans: Vec<String> = company.select(&self.spans).map(text_of).collect();
            for (column, span) in COMPANY_SPANS.iter().zip(spans) {
                fields.insert((*column).to_string(), span);
            }
        }

        let (labelling, labelling_date) = match find("product monograph/veterinary labelling") {
            Some(value) => {
                let date = self
                    .iso_date
                    .find(&text_of(value))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                let link = value
                    .select(&self.pdf_link)
                    .next()
                    .and_then(|a| a.value().attr("href"))
                    .map(|href| self.resolve(href))
                    .unwrap_or_default();
                (link, date)
            },
            None => (String::new(), String::new()),
        };
        fields.insert("Labelling".to_string(), labelling);
        fields.insert("Product Monograph/Veterinary Date".to_string(), labelling_date);

        fields.insert(
            "List of active ingredient".to_string(),
            self.active_ingredients(&document),
        );

        let biosimilar = find("biosimilar biologic drug")
            .map(text_of)
            .filter(|v| v.to_lowercase().starts_with("yes"))
            .map_or("No", |_| "Yes");
        fields.insert(BIOSIMILAR_COLUMN.to_string(), biosimilar.to_string());

        Ok(fields)
    }

    /// `name : strength` lines from the active ingredient table
    fn active_ingredients(&self, document: &Html) -> String {
        let Some(table) = document.select(&self.tables).find(|table| {
            table
                .select(&self.caption)
                .next()
                .is_some_and(|c| text_of(c).contains("List of active ingredient(s)"))
        }) else {
            return String::new();
        };

        table
            .select(&self.table_rows)
            .filter_map(|row| {
                let cells: Vec<String> = row.select(&self.cells).map(text_of).collect();
                match cells.as_slice() {
                    [name, strength] if !name.is_empty() && !strength.is_empty() => {
                        Some(format!("{name} : {strength}"))
                    },
                    [name, _] if !name.is_empty() => Some(name.clone()),
                    _ => None,
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ============================================================================
// HTTP Client
// ============================================================================

#[derive(Debug, Clone)]
pub struct DpdClientConfig {
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Pause before every request to stay polite to the source
    pub request_delay: Duration,
    pub user_agent: String,
}

impl Default for DpdClientConfig {
    fn default() -> Self {
        Self {
            base_url: DPD_BASE_URL.to_string(),
            timeout: Duration::from_secs(90),
            request_delay: Duration::from_millis(80),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

pub struct DpdSourceClient {
    client: Client,
    results_url: String,
    parser: DpdPageParser,
    request_delay: Duration,
}

impl DpdSourceClient {
    pub fn new(config: DpdClientConfig) -> crate::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .build()?;

        let base_url = config.base_url.trim_end_matches('/');
        let parser = DpdPageParser::new(base_url).map_err(crate::IngestError::Config)?;

        Ok(Self {
            client,
            results_url: format!("{base_url}{RESULTS_PATH}"),
            parser,
            request_delay: config.request_delay,
        })
    }

    async fn get_html(&self, url: &str, query: &[(&str, String)]) -> Attempt<String> {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        let response = match self.client.get(url).query(query).send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Retryable(describe_transport(&e)),
        };
        if let Some(failure) = classify_status(response.status()) {
            return failure;
        }
        match response.text().await {
            Ok(body) => Attempt::Ok(body),
            Err(e) => Attempt::Retryable(format!("failed to read response body: {e}")),
        }
    }
}

#[async_trait]
impl SourceClient for DpdSourceClient {
    async fn fetch_page(&self, page: u64) -> Attempt<ListingPage> {
        let query = [
            ("lang", "eng".to_string()),
            ("wbdisable", "true".to_string()),
            ("results_page", page.to_string()),
        ];
        let html = match self.get_html(&self.results_url, &query).await {
            Attempt::Ok(html) => html,
            other => return other.map(|_| ListingPage::default()),
        };

        match self.parser.parse_listing(&html) {
            Ok(listing) => {
                debug!(page, rows = listing.entries.len(), total = ?listing.total, "Parsed listing page");
                Attempt::Ok(listing)
            },
            // Past the last page the results table disappears instead of emptying
            Err(reason) if page > 1 => {
                warn!(page, reason = %reason, "Listing page has no results table, treating as end");
                Attempt::Ok(ListingPage::default())
            },
            Err(reason) => Attempt::Fatal(reason),
        }
    }

    async fn fetch_detail(&self, item: &ItemReference) -> Attempt<Fields> {
        self.get_html(&item.source_id, &[])
            .await
            .and_then(|html| match self.parser.parse_detail(&html) {
                Ok(fields) => Attempt::Ok(fields),
                Err(reason) => Attempt::Fatal(reason),
            })
    }

    fn default_fields(&self) -> Fields {
        let mut fields: Fields = DPD_COLUMNS
            .iter()
            .map(|column| ((*column).to_string(), String::new()))
            .collect();
        fields.insert(BIOSIMILAR_COLUMN.to_string(), "No".to_string());
        fields
    }
}
