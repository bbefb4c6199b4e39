//! Post and attachment extraction from listing and detail-page markup.
//!
//! The listing page is a sequence of `article.post-card` blocks carrying
//! identifier attributes, a timestamp region, a footer with free-text
//! counters, and a link to the post's own detail page. The detail page
//! carries the attachment links. Structural gaps never fail extraction;
//! missing regions leave fields unset.

use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use postvault_shared::{Attachment, Post, is_video_file};

// ---------------------------------------------------------------------------
// Listing page
// ---------------------------------------------------------------------------

/// Parse listing-page markup into posts, in document order.
pub fn extract_posts(markup: &str) -> Vec<Post> {
    let doc = Html::parse_document(markup);
    let card_sel =
        Selector::parse("article.post-card, article.post-card--preview").unwrap();

    let posts: Vec<Post> = doc.select(&card_sel).map(extract_card).collect();
    debug!(posts = posts.len(), "listing page parsed");
    posts
}

/// Extract one post card.
fn extract_card(card: ElementRef<'_>) -> Post {
    let link_sel = Selector::parse("a.fancy-link").unwrap();
    let time_sel = Selector::parse("time.timestamp").unwrap();

    let attr = |name: &str| card.value().attr(name).map(str::to_string);

    let url = card
        .select(&link_sel)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string);

    let timestamp = card
        .select(&time_sel)
        .next()
        .and_then(|t| t.value().attr("datetime"))
        .map(str::to_string);

    let (attachment_count, favorite_count) = extract_counters(card);

    Post {
        id: attr("data-id"),
        service: attr("data-service"),
        user_id: attr("data-user"),
        url,
        timestamp,
        attachment_count,
        favorite_count,
        attachments: Vec::new(),
    }
}

/// Recover the footer counters from free text.
///
/// Lines are scanned case-insensitively for the "attachments" / "favorites"
/// keywords; the leading token of a matching line is the count. Absent or
/// non-numeric tokens leave the field unset.
fn extract_counters(card: ElementRef<'_>) -> (Option<u64>, Option<u64>) {
    let footer_sel = Selector::parse("footer").unwrap();
    let Some(footer) = card.select(&footer_sel).next() else {
        return (None, None);
    };

    let mut attachments = None;
    let mut favorites = None;

    let lines = footer
        .text()
        .flat_map(str::lines)
        .map(str::trim)
        .filter(|l| !l.is_empty());

    for line in lines {
        let lower = line.to_ascii_lowercase();
        let leading = line.split_whitespace().next();
        if lower.contains("attachments") {
            attachments = leading.and_then(|t| t.parse().ok()).or(attachments);
        } else if lower.contains("favorites") {
            favorites = leading.and_then(|t| t.parse().ok()).or(favorites);
        }
    }

    (attachments, favorites)
}

// ---------------------------------------------------------------------------
// Detail page
// ---------------------------------------------------------------------------

/// Collect video attachments from detail-page markup.
///
/// Every `a.post__attachment-link` whose target carries a known video
/// extension qualifies. The filename is the link's declared `download` name
/// when present, else the URL's path basename. Relative hrefs resolve
/// against `base_url`. Malformed markup yields an empty sequence.
pub fn extract_attachments(markup: &str, base_url: &Url) -> Vec<Attachment> {
    let doc = Html::parse_document(markup);
    let link_sel = Selector::parse("a.post__attachment-link").unwrap();

    let mut attachments = Vec::new();
    for link in doc.select(&link_sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Ok(resolved) = base_url.join(href) else {
            continue;
        };
        if !is_video_file(resolved.path()) {
            continue;
        }

        let filename = link
            .value()
            .attr("download")
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| path_basename(&resolved));

        attachments.push(Attachment {
            url: resolved.to_string(),
            filename,
        });
    }

    debug!(count = attachments.len(), "attachment links collected");
    attachments
}

/// Last path segment of a URL, or the full path if there are no segments.
fn path_basename(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or(url.path())
        .to_string()
}
