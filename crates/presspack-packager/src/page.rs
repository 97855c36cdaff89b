use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One addressable page of the generated site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub url: String,
    pub name: String,
    pub meta: JsonValue,
}

/// Props handed to the entry component: every page of the site plus the
/// one currently being rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageProps {
    pub pages: Vec<Page>,
    pub current_page: Page,
}

/// Page metadata attached by the upstream compiler under the "pageMeta"
/// key. Anything other than a JSON object is ignored.
pub fn page_meta(meta: &JsonValue) -> JsonValue {
    match meta.get("pageMeta") {
        Some(value) if value.is_object() => value.clone(),
        _ => JsonValue::Object(Default::default()),
    }
}

/// Join a public URL and a bundle name with exactly one slash.
pub fn url_join(base: &str, path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        format!("/{trimmed}")
    } else {
        format!("{base}/{trimmed}")
    }
}
