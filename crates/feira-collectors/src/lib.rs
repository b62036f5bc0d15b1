//! Price collectors: the AMA bulletin PDF scraper and the Agrolink
//! web/OCR scraper, behind the source traits the sync engine consumes.

use std::io::Cursor;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use feira_core::{
    parse_date_br, parse_decimal_br, parse_unit_details, price_per_kg, sanitize_product_name,
    split_product_label, NewPriceQuote, ALGORITHM_AGROLINK, ALGORITHM_AMA,
};
use feira_storage::{ArtifactStore, HttpFetcher};
use image::imageops::FilterType;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

pub const CRATE_NAME: &str = "feira-collectors";

/// Listing page of the municipal supply authority; bulletin PDFs are
/// linked from the latest "cotação" post.
pub const AMA_LISTING_URL: &str =
    "https://www.juazeiro.ba.gov.br/category/autarquia-municipal-de-abastecimento-ama/";

/// Regional quotations table scraped by the web collector.
pub const AGROLINK_URL: &str = "https://www.agrolink.com.br/regional/ba/juazeiro/cotacoes";

/// Rows are kept only when the location cell mentions this locality.
pub const AGROLINK_TARGET_LOCATION: &str = "Juazeiro";

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] feira_storage::FetchError),
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("pdf extraction failed: {0}")]
    Pdf(String),
    #[error("browser failure: {0}")]
    Browser(String),
    #[error("ocr failure: {0}")]
    Ocr(String),
    #[error("parse failure: {0}")]
    Parse(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Source contracts
// ---------------------------------------------------------------------------

/// Raw (name, price) pair as it appeared in the bulletin, before any
/// normalization. Kept for the debug extraction endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPricePair {
    pub name: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulletinCollection {
    pub source_url: String,
    pub date: NaiveDate,
    pub quotes: Vec<NewPriceQuote>,
    pub raw_pairs: Vec<RawPricePair>,
}

/// One usable row scraped from the quotations table, price already
/// OCR-normalized to a comma-decimal string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebQuotationItem {
    pub raw_label: String,
    pub name: String,
    pub unit: Option<String>,
    pub location: String,
    pub price_text: String,
    pub date_text: String,
}

#[async_trait]
pub trait BulletinSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Collects the bulletin at `url`, or discovers today's bulletin when
    /// `url` is `None`.
    async fn collect(&self, url: Option<&str>) -> Result<BulletinCollection, CollectError>;
}

#[async_trait]
pub trait WebSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn collect(&self) -> Result<Vec<WebQuotationItem>, CollectError>;
}

/// Converts a scraped table row into a persistable quote. Returns `None`
/// when the label cleans to nothing or the price does not parse; such rows
/// are dropped, never written.
pub fn web_item_to_quote(item: &WebQuotationItem) -> Option<NewPriceQuote> {
    let name = sanitize_product_name(&item.name)?;
    let price = parse_decimal_br(&item.price_text)?;
    let unit = item.unit.clone();
    let info = parse_unit_details(unit.as_deref());
    let date = parse_date_br(&item.date_text).unwrap_or_else(|| Utc::now().date_naive());
    Some(NewPriceQuote {
        product_name: name,
        product_unit: unit,
        unit_kind: info.unit_kind,
        unit_kg: info.unit_kg,
        pack_count: info.pack_count,
        price_per_kg: price_per_kg(price, info.unit_kg),
        market_price: price,
        suggested_price: price,
        date,
        algorithm_version: ALGORITHM_AGROLINK.to_string(),
    })
}

// ---------------------------------------------------------------------------
// AMA bulletin collector
// ---------------------------------------------------------------------------

static RX_BULLETIN_PRICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{1,3}(?:\.\d{3})*,\d{2}").expect("price regex"));
static RX_BULLETIN_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{2}/\d{2}/\d{4}\b").expect("date regex"));

pub struct AmaPdfCollector {
    http: HttpFetcher,
    artifacts: Option<ArtifactStore>,
    listing_url: String,
}

impl AmaPdfCollector {
    pub fn new(http: HttpFetcher, artifacts: Option<ArtifactStore>) -> Self {
        Self {
            http,
            artifacts,
            listing_url: AMA_LISTING_URL.to_string(),
        }
    }

    pub fn with_listing_url(mut self, listing_url: impl Into<String>) -> Self {
        self.listing_url = listing_url.into();
        self
    }

    /// Finds today's bulletin: the listing page links a "cotação" post,
    /// which links the PDF under the uploads path. Candidates are probed
    /// with HEAD until one exists.
    pub async fn discover_pdf_url(&self) -> Result<String, CollectError> {
        let listing = self.http.fetch_bytes(&self.listing_url).await?;
        let listing_html = String::from_utf8_lossy(&listing.body).into_owned();
        let post_url = find_quotation_post_link(&listing_html)?
            .ok_or_else(|| CollectError::Discovery("no quotation post link found".into()))?;

        let post = self.http.fetch_bytes(&post_url).await?;
        let post_html = String::from_utf8_lossy(&post.body).into_owned();
        let candidates = find_pdf_candidates(&post_html)?;
        if candidates.is_empty() {
            return Err(CollectError::Discovery(format!(
                "no pdf links under uploads path in {post_url}"
            )));
        }

        for candidate in &candidates {
            if self.http.head_ok(candidate).await {
                return Ok(candidate.clone());
            }
            tracing::debug!(url = %candidate, "pdf candidate rejected by head probe");
        }
        Err(CollectError::Discovery(format!(
            "none of {} pdf candidates responded to HEAD",
            candidates.len()
        )))
    }
}

#[async_trait]
impl BulletinSource for AmaPdfCollector {
    fn source_id(&self) -> &'static str {
        "ama"
    }

    async fn collect(&self, url: Option<&str>) -> Result<BulletinCollection, CollectError> {
        let pdf_url = match url {
            Some(u) => u.to_string(),
            None => self.discover_pdf_url().await?,
        };

        let response = self.http.fetch_bytes(&pdf_url).await?;
        if let Some(artifacts) = &self.artifacts {
            match artifacts
                .store_bytes(Utc::now(), self.source_id(), "pdf", &response.body)
                .await
            {
                Ok(stored) => {
                    tracing::debug!(hash = %stored.content_hash, dedup = stored.deduplicated, "stored bulletin pdf")
                }
                Err(err) => tracing::warn!(error = %err, "failed to store bulletin pdf artifact"),
            }
        }

        let text = extract_pdf_text(&response.body)?;
        let mut collection = parse_bulletin_text(&text)?;
        collection.source_url = pdf_url;
        tracing::info!(
            date = %collection.date,
            quotes = collection.quotes.len(),
            "parsed bulletin"
        );
        Ok(collection)
    }
}

fn find_quotation_post_link(html: &str) -> Result<Option<String>, CollectError> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a").map_err(|e| CollectError::Parse(e.to_string()))?;
    for anchor in document.select(&anchors) {
        let text = anchor.text().collect::<String>().to_lowercase();
        // Matches "cotação" with or without the cedilla/tilde.
        if text.contains("cota") {
            if let Some(href) = anchor.value().attr("href") {
                if href.starts_with("http") {
                    return Ok(Some(href.to_string()));
                }
            }
        }
    }
    Ok(None)
}

fn find_pdf_candidates(html: &str) -> Result<Vec<String>, CollectError> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a").map_err(|e| CollectError::Parse(e.to_string()))?;
    let mut out = Vec::new();
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let path = href.split('?').next().unwrap_or(href);
        if path.to_lowercase().ends_with(".pdf")
            && href.contains("/wp-content/uploads/")
            && !out.contains(&href.to_string())
        {
            out.push(href.to_string());
        }
    }
    Ok(out)
}

pub fn extract_pdf_text(bytes: &[u8]) -> Result<String, CollectError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| CollectError::Pdf(e.to_string()))
}

/// Parses bulletin text into quotes. The bulletin lays each product out as
/// three lines: name, measure hint, then a line carrying the price. The
/// single dd/mm/yyyy token in the text dates every quote of the run.
pub fn parse_bulletin_text(text: &str) -> Result<BulletinCollection, CollectError> {
    let date_token = RX_BULLETIN_DATE
        .find(text)
        .ok_or_else(|| CollectError::Parse("no dd/mm/yyyy date token in bulletin text".into()))?;
    let date = parse_date_br(date_token.as_str())
        .ok_or_else(|| CollectError::Parse(format!("invalid date token {}", date_token.as_str())))?;

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let mut quotes = Vec::new();
    let mut raw_pairs = Vec::new();

    for i in 2..lines.len() {
        // Last currency-formatted amount on the line is the price.
        let Some(price_match) = RX_BULLETIN_PRICE.find_iter(lines[i]).last() else {
            continue;
        };
        let name_line = lines[i - 2];
        let measure_line = lines[i - 1];
        if name_line.to_lowercase().starts_with("data") {
            continue;
        }

        let Some(price) = parse_decimal_br(price_match.as_str()) else {
            tracing::warn!(line = lines[i], "unparseable bulletin price, dropping row");
            continue;
        };
        raw_pairs.push(RawPricePair {
            name: name_line.to_string(),
            price,
        });

        let Some(name) = sanitize_product_name(name_line) else {
            tracing::warn!(raw = name_line, "bulletin name cleaned to empty, dropping row");
            continue;
        };
        let (unit_kind, unit_kg) = measure_to_unit(measure_line);

        quotes.push(NewPriceQuote {
            product_name: name,
            product_unit: None,
            unit_kind,
            unit_kg,
            pack_count: None,
            price_per_kg: price_per_kg(price, unit_kg),
            market_price: price,
            suggested_price: price,
            date,
            algorithm_version: ALGORITHM_AMA.to_string(),
        });
    }

    Ok(BulletinCollection {
        source_url: String::new(),
        date,
        quotes,
        raw_pairs,
    })
}

fn measure_to_unit(measure: &str) -> (Option<String>, Option<f64>) {
    let upper = measure.to_uppercase();
    if upper.contains("KG") {
        (Some("Kg".to_string()), Some(1.0))
    } else if upper.contains("UNID") {
        (Some("Un".to_string()), None)
    } else {
        (None, None)
    }
}

// ---------------------------------------------------------------------------
// Agrolink web/OCR collector
// ---------------------------------------------------------------------------

const OCR_CELL_WIDTH: u32 = 48;
const OCR_CELL_HEIGHT: u32 = 17;
const OCR_THRESHOLD: u8 = 180;
const OCR_SCALE: u32 = 3;
const OCR_RETRY_SCALE: u32 = 4;

/// One table row as captured by the browser, price cell as a PNG crop.
#[derive(Debug, Clone)]
pub struct BrowserRow {
    pub label: String,
    pub location: String,
    pub date_text: String,
    pub price_crop_png: Vec<u8>,
}

#[async_trait]
pub trait QuotationBrowser: Send + Sync {
    async fn collect_rows(&self, url: &str) -> Result<Vec<BrowserRow>, CollectError>;
}

#[async_trait]
pub trait DigitOcr: Send + Sync {
    /// Recognizes text in the image, constrained to digits and the two
    /// decimal separators.
    async fn recognize_digits(&self, png: &[u8]) -> Result<String, CollectError>;
}

pub struct AgrolinkCollector {
    browser: Box<dyn QuotationBrowser>,
    ocr: Box<dyn DigitOcr>,
    artifacts: Option<ArtifactStore>,
    url: String,
    target_location: String,
}

impl AgrolinkCollector {
    pub fn new(
        browser: Box<dyn QuotationBrowser>,
        ocr: Box<dyn DigitOcr>,
        artifacts: Option<ArtifactStore>,
    ) -> Self {
        Self {
            browser,
            ocr,
            artifacts,
            url: AGROLINK_URL.to_string(),
            target_location: AGROLINK_TARGET_LOCATION.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    async fn ocr_price(&self, crop: &[u8], scale: u32) -> Result<Option<String>, CollectError> {
        let preprocessed = preprocess_price_crop(crop, scale)?;
        let raw = self.ocr.recognize_digits(&preprocessed).await?;
        Ok(normalize_price_text(&raw))
    }
}

#[async_trait]
impl WebSource for AgrolinkCollector {
    fn source_id(&self) -> &'static str {
        "agrolink"
    }

    async fn collect(&self) -> Result<Vec<WebQuotationItem>, CollectError> {
        let rows = self.browser.collect_rows(&self.url).await?;
        let mut items = Vec::new();

        for row in rows {
            if !row
                .location
                .to_lowercase()
                .contains(&self.target_location.to_lowercase())
            {
                continue;
            }

            let price_text = match self.ocr_price(&row.price_crop_png, OCR_SCALE).await {
                Ok(Some(p)) => Some(p),
                Ok(None) | Err(_) => {
                    // One retry at higher upscale, then give up on the row.
                    self.ocr_price(&row.price_crop_png, OCR_RETRY_SCALE)
                        .await
                        .unwrap_or(None)
                }
            };
            let Some(price_text) = price_text else {
                tracing::warn!(label = %row.label, "ocr yielded no usable price, skipping row");
                if let Some(artifacts) = &self.artifacts {
                    let _ = artifacts
                        .store_bytes(Utc::now(), self.source_id(), "png", &row.price_crop_png)
                        .await;
                }
                continue;
            };

            let split = split_product_label(&row.label);
            items.push(WebQuotationItem {
                raw_label: row.label,
                name: split.name,
                unit: split.unit,
                location: row.location,
                price_text,
                date_text: row.date_text,
            });
        }

        tracing::info!(items = items.len(), "collected quotation rows");
        Ok(items)
    }
}

/// Grayscale, binarize and upscale the price-cell crop so the digits are
/// large and high-contrast before recognition.
pub fn preprocess_price_crop(png: &[u8], scale: u32) -> Result<Vec<u8>, CollectError> {
    let img = image::load_from_memory(png).map_err(|e| CollectError::Ocr(e.to_string()))?;
    let mut gray = img.to_luma8();
    for pixel in gray.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > OCR_THRESHOLD { 255 } else { 0 };
    }
    let resized = image::imageops::resize(
        &gray,
        OCR_CELL_WIDTH * scale,
        OCR_CELL_HEIGHT * scale,
        FilterType::Triangle,
    );
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(resized)
        .write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| CollectError::Ocr(e.to_string()))?;
    Ok(out.into_inner())
}

/// Normalizes recognized text into a comma-decimal price string.
/// "62.80" and "62,80" both become "62,80"; an unpunctuated run of 3+
/// digits is read as cents-last ("6280" becomes "62,80").
pub fn normalize_price_text(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.chars().any(|c| c == '.' || c == ',') {
        let candidate = cleaned.replace('.', ",");
        return if parse_decimal_br(&candidate).is_some() {
            Some(candidate)
        } else {
            None
        };
    }
    if cleaned.len() >= 3 {
        let (int_part, cents) = cleaned.split_at(cleaned.len() - 2);
        let int_part = int_part.trim_start_matches('0');
        let int_part = if int_part.is_empty() { "0" } else { int_part };
        return Some(format!("{int_part},{cents}"));
    }
    None
}

/// Headless-Chrome implementation of [`QuotationBrowser`]. The CDP client
/// is synchronous, so the whole session runs on the blocking pool.
pub struct ChromeQuotationBrowser;

impl ChromeQuotationBrowser {
    fn collect_rows_blocking(url: &str) -> anyhow::Result<Vec<BrowserRow>> {
        use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
        use headless_chrome::{Browser, LaunchOptions};

        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .build()
            .map_err(|e| anyhow::anyhow!("building launch options: {e}"))?;
        let browser = Browser::new(options)?;
        let tab = browser.new_tab()?;
        tab.navigate_to(url)?;
        tab.wait_until_navigated()?;
        tab.wait_for_element("table.table-main tbody tr")?;

        let mut rows = Vec::new();
        for tr in tab.find_elements("table.table-main tbody tr")? {
            let cells = tr.find_elements("td")?;
            if cells.len() < 4 {
                continue;
            }
            let label = feira_core::norm_spaces(&cells[0].get_inner_text()?);
            let location = cells[1].get_inner_text()?.trim().to_string();
            let date_text = cells[3].get_inner_text()?.trim().to_string();

            // Price is rendered in a right-aligned div inside the third cell.
            let Ok(price_el) = tr.find_element("td:nth-child(3) div.text-right.float-right")
            else {
                continue;
            };
            let price_crop_png =
                price_el.capture_screenshot(CaptureScreenshotFormatOption::Png)?;

            rows.push(BrowserRow {
                label,
                location,
                date_text,
                price_crop_png,
            });
        }
        Ok(rows)
    }
}

#[async_trait]
impl QuotationBrowser for ChromeQuotationBrowser {
    async fn collect_rows(&self, url: &str) -> Result<Vec<BrowserRow>, CollectError> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || Self::collect_rows_blocking(&url))
            .await
            .map_err(|e| CollectError::Browser(e.to_string()))?
            .map_err(|e| CollectError::Browser(e.to_string()))
    }
}

/// [`DigitOcr`] backed by the tesseract CLI. The crop is written to a
/// temp file and recognized with a digit/punctuation whitelist.
pub struct TesseractCliOcr {
    binary: String,
}

impl TesseractCliOcr {
    pub fn new() -> Self {
        Self {
            binary: "tesseract".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for TesseractCliOcr {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DigitOcr for TesseractCliOcr {
    async fn recognize_digits(&self, png: &[u8]) -> Result<String, CollectError> {
        let dir = tempfile::tempdir().map_err(|e| CollectError::Ocr(e.to_string()))?;
        let input = dir.path().join("crop.png");
        tokio::fs::write(&input, png)
            .await
            .map_err(|e| CollectError::Ocr(e.to_string()))?;

        let output = Command::new(&self.binary)
            .arg(&input)
            .arg("stdout")
            .args(["--psm", "7"])
            .args(["-c", "tessedit_char_whitelist=0123456789.,"])
            .output()
            .await
            .map_err(|e| CollectError::Ocr(format!("spawning {}: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(CollectError::Ocr(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
