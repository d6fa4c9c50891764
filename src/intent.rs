//! One-shot pending clarification intent per user.
//!
//! A spec or bundle question sets the register; the very next turn consumes
//! it whether or not it was used.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::debug;

use crate::catalog::normalize::{is_meaningful_token, query_tokens};
use crate::catalog::CatalogSnapshot;
use crate::error::ShopChatError;

const SPEC_PATTERN: &str = r"(?i)ขนาด|สเปค|สเป็ค|ไซส์|ไซซ์|กว้าง|ยาว|หนา|สูง|เส้นผ่าน|กี่มิล|กี่ซม|กี่เซน|\bsize\b|\bdimensions?\b|\bspecs?\b";
const BUNDLE_PATTERN: &str = r"(?i)กี่\s*(?:เส้น|ชิ้น|อัน|แผ่น|ท่อน)?\s*(?:ต่อ|ใน)?\s*มัด|มัดละ|ต่อมัด|ในมัด|\bper\s+bundle\b|\bpcs\s*/\s*bundle\b|\bbundle\s+size\b";

pub const SPEC_HINT: &str = "(ลูกค้าถามขนาด/สเปคของสินค้านี้ต่อจากข้อความก่อนหน้า กรุณาระบุขนาดให้ชัดเจน)";
pub const BUNDLE_HINT: &str = "(ลูกค้าถามจำนวนต่อมัดของสินค้านี้ต่อจากข้อความก่อนหน้า กรุณาระบุว่ามัดละกี่ชิ้น)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntentClass {
    pub wants_spec: bool,
    pub wants_bundle: bool,
}

impl IntentClass {
    pub fn any(&self) -> bool {
        self.wants_spec || self.wants_bundle
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingIntent {
    pub wants_spec: bool,
    pub wants_bundle: bool,
    pub product_group: Option<String>,
    pub created_at: Instant,
}

pub struct IntentTracker {
    spec_re: Regex,
    bundle_re: Regex,
    ttl: Duration,
    pending: Mutex<HashMap<String, PendingIntent>>,
}

impl IntentTracker {
    pub fn new(ttl: Duration) -> Result<Self, ShopChatError> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| ShopChatError::Config(format!("invalid intent pattern: {e}")))
        };
        Ok(Self {
            spec_re: compile(SPEC_PATTERN)?,
            bundle_re: compile(BUNDLE_PATTERN)?,
            ttl,
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingIntent>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn classify(&self, text: &str) -> IntentClass {
        IntentClass {
            wants_spec: self.spec_re.is_match(text),
            wants_bundle: self.bundle_re.is_match(text),
        }
    }

    /// Removes the spec/bundle question phrases so only product words remain.
    fn product_words(&self, text: &str) -> String {
        let without_spec = self.spec_re.replace_all(text, " ");
        self.bundle_re.replace_all(&without_spec, " ").into_owned()
    }

    fn detect_group(&self, catalog: &CatalogSnapshot, text: &str) -> Option<String> {
        catalog.best_guess_group(&self.product_words(text))
    }

    /// Has a meaningful token and is not itself a spec/bundle question.
    pub fn looks_like_bare_product(&self, text: &str) -> bool {
        !self.classify(text).any() && query_tokens(text).iter().any(|t| is_meaningful_token(t))
    }

    pub fn pending(&self, user_key: &str) -> Option<PendingIntent> {
        self.lock_pending().get(user_key).cloned()
    }

    /// Processes one turn and returns the (possibly augmented) merged text.
    ///
    /// `last_fragment` is the final raw fragment of the flushed batch.
    pub fn apply(
        &self,
        user_key: &str,
        last_fragment: &str,
        merged_text: &str,
        catalog: &CatalogSnapshot,
    ) -> String {
        let class = self.classify(last_fragment);
        if class.any() {
            let product_group = self
                .detect_group(catalog, last_fragment)
                .or_else(|| self.detect_group(catalog, merged_text));
            debug!(
                user = user_key,
                wants_spec = class.wants_spec,
                wants_bundle = class.wants_bundle,
                group = ?product_group,
                "pending intent set"
            );
            self.lock_pending().insert(
                user_key.to_string(),
                PendingIntent {
                    wants_spec: class.wants_spec,
                    wants_bundle: class.wants_bundle,
                    product_group,
                    created_at: Instant::now(),
                },
            );
            return merged_text.to_string();
        }

        let Some(intent) = self.lock_pending().remove(user_key) else {
            return merged_text.to_string();
        };
        if intent.created_at.elapsed() > self.ttl {
            debug!(user = user_key, "pending intent expired");
            return merged_text.to_string();
        }
        if !self.looks_like_bare_product(last_fragment) {
            return merged_text.to_string();
        }
        let group = catalog.best_guess_group(last_fragment);
        match (&group, &intent.product_group) {
            (Some(current), Some(pending)) if current == pending => {}
            _ => {
                debug!(
                    user = user_key,
                    current = ?group,
                    pending = ?intent.product_group,
                    "pending intent discarded"
                );
                return merged_text.to_string();
            }
        }

        let mut augmented = merged_text.trim_end().to_string();
        if intent.wants_spec {
            augmented.push(' ');
            augmented.push_str(SPEC_HINT);
        }
        if intent.wants_bundle {
            augmented.push(' ');
            augmented.push_str(BUNDLE_HINT);
        }
        debug!(user = user_key, "pending intent carried into turn");
        augmented
    }

    /// Drops intents older than the TTL.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut pending = self.lock_pending();
        let before = pending.len();
        pending.retain(|_, intent| intent.created_at.elapsed() <= ttl);
        before - pending.len()
    }
}
