//! SEO signal extraction from rendered HTML.
//!
//! Runs after a successful render and feeds the blob metadata. Everything
//! here is mechanical: selector lookups with fallback chains (title →
//! `og:title` → `twitter:title`), counts, and a soft-404 heuristic for
//! pages that return HTTP 200 while telling the user the content is gone.
//!
//! Extraction is total — a selector that fails to parse or match degrades
//! to an empty field rather than an error.

use std::collections::BTreeMap;

use scraper::{Html, Selector};
use url::Url;

/// Phrases that mark a 200 response as a soft 404 when they appear in the
/// title or first H1.
const SOFT_404_MARKERS: &[&str] = &[
    "404",
    "page not found",
    "not found",
    "page doesn't exist",
    "no longer available",
];

/// Signals extracted from one rendered page. Missing text fields are empty
/// strings, matching how they are flattened into blob metadata.
#[derive(Debug, Clone, Default)]
pub struct SeoAnalysis {
    pub title: String,
    pub meta_description: String,
    pub h1: String,
    pub h1_count: usize,
    pub canonical: String,
    pub og_title: String,
    pub og_description: String,
    pub og_image: String,
    pub twitter_card: String,
    pub twitter_title: String,
    pub has_viewport: bool,
    pub noindex: bool,
    pub word_count: usize,
    pub is_soft_404: bool,
}

impl SeoAnalysis {
    /// Flatten into the blob metadata map. Booleans and numbers are
    /// stringified; missing fields stay as empty strings.
    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("title".to_string(), self.title.clone());
        map.insert("metaDescription".to_string(), self.meta_description.clone());
        map.insert("h1".to_string(), self.h1.clone());
        map.insert("h1Count".to_string(), self.h1_count.to_string());
        map.insert("canonical".to_string(), self.canonical.clone());
        map.insert("ogTitle".to_string(), self.og_title.clone());
        map.insert("ogDescription".to_string(), self.og_description.clone());
        map.insert("ogImage".to_string(), self.og_image.clone());
        map.insert("twitterCard".to_string(), self.twitter_card.clone());
        map.insert("twitterTitle".to_string(), self.twitter_title.clone());
        map.insert("hasViewport".to_string(), self.has_viewport.to_string());
        map.insert("noindex".to_string(), self.noindex.to_string());
        map.insert("wordCount".to_string(), self.word_count.to_string());
        map.insert("softNotFound".to_string(), self.is_soft_404.to_string());
        map
    }
}

/// Analyze a rendered page.
///
/// `final_url` resolves relative canonical links; `x_robots_tag` is the
/// response header captured by the render driver and participates in the
/// noindex signal alongside robots meta tags.
pub fn analyze(
    html: &str,
    status_code: u16,
    final_url: &str,
    x_robots_tag: Option<&str>,
) -> SeoAnalysis {
    let doc = Html::parse_document(html);

    let title = {
        let title = extract_first_text(&doc, "title");
        if !title.is_empty() {
            title
        } else {
            let og = extract_meta_content(&doc, "meta[property=\"og:title\"]");
            if !og.is_empty() {
                og
            } else {
                extract_meta_content(&doc, "meta[name=\"twitter:title\"]")
            }
        }
    };

    let meta_description = {
        let desc = extract_meta_content(&doc, "meta[name=\"description\"]");
        if !desc.is_empty() {
            desc
        } else {
            let og = extract_meta_content(&doc, "meta[property=\"og:description\"]");
            if !og.is_empty() {
                og
            } else {
                extract_meta_content(&doc, "meta[name=\"twitter:description\"]")
            }
        }
    };

    let h1 = extract_first_text(&doc, "h1");
    let h1_count = count_elements(&doc, "h1");
    let canonical = extract_canonical(&doc, final_url);

    let og_title = extract_meta_content(&doc, "meta[property=\"og:title\"]");
    let og_description = extract_meta_content(&doc, "meta[property=\"og:description\"]");
    let og_image = extract_meta_content(&doc, "meta[property=\"og:image\"]");
    let twitter_card = extract_meta_content(&doc, "meta[name=\"twitter:card\"]");
    let twitter_title = extract_meta_content(&doc, "meta[name=\"twitter:title\"]");

    let has_viewport = count_elements(&doc, "meta[name=\"viewport\"]") > 0;

    let noindex = has_noindex_meta(&doc)
        || x_robots_tag
            .map(|v| v.to_ascii_lowercase().contains("noindex"))
            .unwrap_or(false);

    let word_count = count_words(&doc);
    let is_soft_404 = detect_soft_404(status_code, &title, &h1);

    SeoAnalysis {
        title,
        meta_description,
        h1,
        h1_count,
        canonical,
        og_title,
        og_description,
        og_image,
        twitter_card,
        twitter_title,
        has_viewport,
        noindex,
        word_count,
        is_soft_404,
    }
}

fn extract_first_text(doc: &Html, selector: &str) -> String {
    let Ok(selector) = Selector::parse(selector) else {
        return String::new();
    };

    doc.select(&selector)
        .map(|el| normalize_text(&el.text().collect::<Vec<_>>().join(" ")))
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

fn extract_meta_content(doc: &Html, selector: &str) -> String {
    let Ok(selector) = Selector::parse(selector) else {
        return String::new();
    };

    doc.select(&selector)
        .find_map(|el| el.value().attr("content"))
        .map(normalize_text)
        .unwrap_or_default()
}

fn extract_canonical(doc: &Html, page_url: &str) -> String {
    let Ok(selector) = Selector::parse("link[rel=\"canonical\"]") else {
        return String::new();
    };

    let Some(href) = doc
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|h| h.trim().to_string())
    else {
        return String::new();
    };

    if href.starts_with("http://") || href.starts_with("https://") {
        return href;
    }

    Url::parse(page_url)
        .ok()
        .and_then(|base| base.join(&href).ok())
        .map(|u| u.to_string())
        .unwrap_or(href)
}

fn has_noindex_meta(doc: &Html) -> bool {
    let Ok(selector) = Selector::parse("meta[name=\"robots\"], meta[name=\"googlebot\"]") else {
        return false;
    };

    doc.select(&selector).any(|el| {
        el.value()
            .attr("content")
            .is_some_and(|content| content.to_ascii_lowercase().contains("noindex"))
    })
}

fn count_elements(doc: &Html, selector: &str) -> usize {
    match Selector::parse(selector) {
        Ok(selector) => doc.select(&selector).count(),
        Err(_) => 0,
    }
}

fn count_words(doc: &Html) -> usize {
    let Ok(selector) = Selector::parse("body") else {
        return 0;
    };
    doc.select(&selector)
        .next()
        .map(|body| {
            body.text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .count()
        })
        .unwrap_or(0)
}

fn detect_soft_404(status_code: u16, title: &str, h1: &str) -> bool {
    if status_code != 200 {
        return false;
    }
    let haystack = format!("{} {}", title.to_lowercase(), h1.to_lowercase());
    SOFT_404_MARKERS
        .iter()
        .any(|marker| haystack.contains(marker))
}

fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
