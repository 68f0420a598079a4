//! Worklist generation: an id range and a URL template expanded into
//! [`WorkItem`]s.

use url::Url;

use imgdesc_shared::{ImgDescError, Result, WorkItem, WorklistConfig};

/// The substitution point inside a URL template.
pub const ID_PLACEHOLDER: &str = "{id}";

/// An inclusive, 1-indexed id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemRange {
    start: i64,
    end: i64,
}

impl ItemRange {
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start < 1 {
            return Err(ImgDescError::config(format!(
                "range start must be at least 1, got {start}"
            )));
        }
        if start > end {
            return Err(ImgDescError::config(format!(
                "range start {start} is after range end {end}"
            )));
        }
        Ok(Self { start, end })
    }
}

/// A URL pattern with exactly one `{id}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    template: String,
}

impl UrlTemplate {
    /// Validate `template`.
    ///
    /// The placeholder must appear exactly once and a rendered sample must
    /// be an absolute `http` or `https` URL.
    pub fn parse(template: &str) -> Result<Self> {
        let placeholders = template.matches(ID_PLACEHOLDER).count();
        if placeholders != 1 {
            return Err(ImgDescError::config(format!(
                "URL template must contain {ID_PLACEHOLDER} exactly once, found {placeholders}: {template}"
            )));
        }

        let parsed = Self {
            template: template.to_string(),
        };
        let sample = parsed.render(1);
        let url = Url::parse(&sample).map_err(|e| {
            ImgDescError::config(format!("URL template does not render a valid URL ({e}): {template}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ImgDescError::config(format!(
                "URL template must use http or https, got {}: {template}",
                url.scheme()
            )));
        }

        Ok(parsed)
    }

    /// Substitute `id` in decimal. No escaping is applied.
    pub fn render(&self, id: i64) -> String {
        self.template.replacen(ID_PLACEHOLDER, &id.to_string(), 1)
    }
}

/// One work item per id in `range`, ids strictly increasing.
pub fn generate(range: ItemRange, template: &UrlTemplate) -> Vec<WorkItem> {
    (range.start..=range.end)
        .map(|id| WorkItem::new(id, template.render(id)))
        .collect()
}

/// Validate a worklist configuration and expand it.
pub fn from_config(config: &WorklistConfig) -> Result<Vec<WorkItem>> {
    let range = ItemRange::new(config.start, config.end)?;
    let template = UrlTemplate::parse(&config.url_template)?;
    Ok(generate(range, &template))
}
