//! Canonical text extraction from crawl records.

use crate::models::CrawlRecord;

/// Combine title, description meta-tag, and body into one labeled string.
///
/// Missing fields contribute empty strings; the labels are always present.
/// An empty return value means the record has nothing to embed and should
/// be skipped, which is not an error.
pub fn extract_text(record: &CrawlRecord) -> String {
    let title = record.title.as_deref().unwrap_or("");
    let content = record.content_text.as_deref().unwrap_or("");
    let description = record
        .meta_tags
        .iter()
        .find(|tag| {
            tag.name.as_deref() == Some("description")
                && tag.content.as_deref().is_some_and(|c| !c.is_empty())
        })
        .and_then(|tag| tag.content.as_deref())
        .unwrap_or("");

    if title.is_empty() && description.is_empty() && content.is_empty() {
        return String::new();
    }

    format!("Title: {title}\nDescription: {description}\nContent: {content}")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: serde_json::Value) -> CrawlRecord {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn combines_all_three_parts() {
        let r = record(serde_json::json!({
            "url": "http://x",
            "title": "Hi",
            "content_text": "body",
            "meta_tags": [
                {"name": "keywords", "content": "a,b"},
                {"name": "description", "content": "desc"}
            ]
        }));
        assert_eq!(extract_text(&r), "Title: Hi\nDescription: desc\nContent: body");
    }

    #[test]
    fn missing_fields_keep_labels() {
        let r = record(serde_json::json!({"url": "http://x", "title": "Hi"}));
        assert_eq!(extract_text(&r), "Title: Hi\nDescription: \nContent:");
    }

    #[test]
    fn first_matching_description_wins() {
        let r = record(serde_json::json!({
            "url": "http://x",
            "meta_tags": [
                {"name": "description", "content": "first"},
                {"name": "description", "content": "second"}
            ]
        }));
        assert!(extract_text(&r).contains("Description: first"));
    }

    #[test]
    fn empty_description_content_is_skipped() {
        let r = record(serde_json::json!({
            "url": "http://x",
            "meta_tags": [
                {"name": "description", "content": ""},
                {"name": "description", "content": "real"}
            ]
        }));
        assert!(extract_text(&r).contains("Description: real"));
    }

    #[test]
    fn fully_empty_record_signals_no_text() {
        let r = record(serde_json::json!({
            "url": "http://x",
            "title": "",
            "content_text": "",
            "meta_tags": [{"name": "viewport", "content": "width=device-width"}]
        }));
        assert_eq!(extract_text(&r), "");
    }
}
