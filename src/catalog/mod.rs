//! Product catalog index: parsed records, normalized lookup and an
//! atomically swappable snapshot handle.

pub mod csv;
pub mod normalize;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::error::ShopChatError;
use normalize::{is_meaningful_token, leading_token, normalize, query_tokens};

#[derive(Debug, Clone, PartialEq)]
pub struct ProductRecord {
    pub name: String,
    pub price: Option<f64>,
    pub unit: Option<String>,
    pub aliases: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub specification: Option<String>,
    pub pcs_per_bundle: Option<u32>,
    pub search_key: String,
    pub code: Option<u32>,
}

/// Extracts a `#26`-style product code from a display name.
pub fn extract_code(name: &str) -> Option<u32> {
    name.match_indices('#').find_map(|(idx, _)| {
        let digits: String = name[idx + 1..]
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    })
}

impl ProductRecord {
    pub fn new(
        name: String,
        price: Option<f64>,
        unit: Option<String>,
        aliases: BTreeSet<String>,
        tags: BTreeSet<String>,
        specification: Option<String>,
        pcs_per_bundle: Option<u32>,
    ) -> Self {
        let mut search_key = normalize(&name);
        for extra in aliases.iter().chain(tags.iter()) {
            search_key.push_str(&normalize(extra));
        }
        let code = extract_code(&name);
        Self {
            name,
            price,
            unit,
            aliases,
            tags,
            specification,
            pcs_per_bundle,
            search_key,
            code,
        }
    }

    /// Coarse topic group: first token of the normalized name.
    pub fn group_key(&self) -> Option<String> {
        leading_token(&self.name)
    }

    /// Single descriptive line embedded in the assistant prompt.
    pub fn render_line(&self) -> String {
        let mut line = format!("- {}", self.name);
        match self.price {
            Some(price) => {
                line.push_str(&format!(" | ราคา {} บาท", format_price(price)));
                if let Some(unit) = &self.unit {
                    line.push_str(&format!("/{unit}"));
                }
            }
            None => {
                line.push_str(" | ราคา ไม่ระบุ");
                if let Some(unit) = &self.unit {
                    line.push_str(&format!(" | หน่วย {unit}"));
                }
            }
        }
        if !self.aliases.is_empty() {
            let aliases: Vec<&str> = self.aliases.iter().map(String::as_str).collect();
            line.push_str(&format!(" | ชื่อเรียก: {}", aliases.join(", ")));
        }
        if !self.tags.is_empty() {
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            line.push_str(&format!(" | หมวด: {}", tags.join(", ")));
        }
        if let Some(spec) = &self.specification {
            line.push_str(&format!(" | ขนาด: {spec}"));
        }
        if let Some(pcs) = self.pcs_per_bundle {
            line.push_str(&format!(" | มัดละ {pcs}"));
        }
        line
    }
}

fn format_price(price: f64) -> String {
    if price.fract() == 0.0 {
        format!("{price:.0}")
    } else {
        format!("{price:.2}")
    }
}

/// Immutable index built once per load.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    products: Vec<ProductRecord>,
    exact: HashMap<String, usize>,
}

impl CatalogSnapshot {
    pub fn new(products: Vec<ProductRecord>) -> Self {
        let mut exact = HashMap::new();
        for (idx, product) in products.iter().enumerate() {
            let key = normalize(&product.name);
            if !key.is_empty() {
                exact.entry(key).or_insert(idx);
            }
        }
        // Names win over aliases when they collide.
        for (idx, product) in products.iter().enumerate() {
            for alias in &product.aliases {
                let key = normalize(alias);
                if !key.is_empty() {
                    exact.entry(key).or_insert(idx);
                }
            }
        }
        Self { products, exact }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn products(&self) -> &[ProductRecord] {
        &self.products
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Best matching product for free text.
    ///
    /// Exact normalized name/alias hits win. Otherwise every meaningful query
    /// token must occur in the candidate's search key, and a candidate whose
    /// code is not among the query's numbers is rejected. Ranking: token
    /// overlap, then code match, then shortest name, then catalog order.
    pub fn lookup(&self, query: &str) -> Option<&ProductRecord> {
        let key = normalize(query);
        if key.is_empty() {
            return None;
        }
        if let Some(idx) = self.exact.get(&key) {
            return self.products.get(*idx);
        }

        let tokens = query_tokens(query);
        let required: Vec<&String> = tokens.iter().filter(|t| is_meaningful_token(t)).collect();
        if required.is_empty() {
            return None;
        }
        let codes: Vec<u32> = tokens.iter().filter_map(|t| t.parse().ok()).collect();

        let mut best: Option<(usize, bool, usize, usize)> = None;
        for (idx, product) in self.products.iter().enumerate() {
            if !required.iter().all(|t| product.search_key.contains(t.as_str())) {
                continue;
            }
            let code_match = match product.code {
                Some(code) if !codes.is_empty() => {
                    if !codes.contains(&code) {
                        continue;
                    }
                    true
                }
                _ => false,
            };
            let overlap = tokens
                .iter()
                .filter(|t| product.search_key.contains(t.as_str()))
                .count();
            let name_len = product.name.chars().count();
            let better = match best {
                None => true,
                Some((b_overlap, b_code, b_len, _)) => {
                    (overlap, code_match, std::cmp::Reverse(name_len))
                        > (b_overlap, b_code, std::cmp::Reverse(b_len))
                }
            };
            if better {
                best = Some((overlap, code_match, name_len, idx));
            }
        }
        best.and_then(|(_, _, _, idx)| self.products.get(idx))
    }

    /// Group of the best catalog match for `text`, if any.
    pub fn best_guess_group(&self, text: &str) -> Option<String> {
        self.lookup(text).and_then(ProductRecord::group_key)
    }

    pub fn render_lines(&self) -> String {
        self.products
            .iter()
            .map(ProductRecord::render_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Reads catalog text from a local path or an http(s) URL and indexes it.
pub async fn load_catalog(
    source: &str,
    http: &reqwest::Client,
) -> Result<CatalogSnapshot, ShopChatError> {
    let text = if source.starts_with("http://") || source.starts_with("https://") {
        let response = http
            .get(source)
            .send()
            .await
            .map_err(|e| ShopChatError::CatalogLoad(format!("fetching {source}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ShopChatError::CatalogLoad(format!(
                "fetching {source}: HTTP {status}"
            )));
        }
        response
            .text()
            .await
            .map_err(|e| ShopChatError::CatalogLoad(format!("reading {source}: {e}")))?
    } else {
        tokio::fs::read_to_string(source)
            .await
            .map_err(|e| ShopChatError::CatalogLoad(format!("reading {source}: {e}")))?
    };
    let products = csv::parse_catalog(&text)?;
    Ok(CatalogSnapshot::new(products))
}

/// Shared handle; readers clone the current `Arc` and never see a partial index.
pub struct Catalog {
    source: Option<String>,
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl Catalog {
    pub fn new(source: Option<String>, snapshot: CatalogSnapshot) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, snapshot: CatalogSnapshot) {
        let next = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Loads the configured source at startup; failures leave an empty catalog.
    pub async fn open(source: Option<String>, http: &reqwest::Client) -> Self {
        let catalog = Self::new(source, CatalogSnapshot::empty());
        match catalog.reload(http).await {
            Ok(count) => info!(products = count, "catalog loaded"),
            Err(e) => warn!("catalog unavailable, starting with an empty catalog: {e}"),
        }
        catalog
    }

    /// Rebuilds from the source and swaps it in. The previous snapshot stays
    /// in service when loading fails.
    pub async fn reload(&self, http: &reqwest::Client) -> Result<usize, ShopChatError> {
        let source = self
            .source
            .as_deref()
            .ok_or_else(|| ShopChatError::CatalogLoad("no catalog source configured".into()))?;
        let snapshot = load_catalog(source, http).await?;
        let count = snapshot.len();
        self.replace(snapshot);
        Ok(count)
    }
}
