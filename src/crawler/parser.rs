//! HTML parser for catalog listing pages
//!
//! This module handles parsing one listing page to extract:
//! - Product entries (title, link, price, availability, rating, image)
//! - The link to the next listing page, if any

use super::fetcher::PageStep;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// One product entry found on a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingItem {
    pub title: String,
    /// Absolute product URL
    pub url: String,
    pub price: String,
    pub availability: String,
    /// Star rating 1..=5, None when the entry shows no rating
    pub rating: Option<u8>,
    /// Absolute image URL
    pub image_url: String,
}

/// Extracted information from a listing page
#[derive(Debug, Clone)]
pub struct ParsedListing {
    pub items: Vec<ListingItem>,
    pub next: PageStep,
}

struct ListingSelectors {
    product: Selector,
    title: Selector,
    price: Selector,
    availability: Selector,
    rating: Selector,
    image: Selector,
    next: Selector,
}

impl ListingSelectors {
    fn new() -> Result<Self, String> {
        let parse = |css: &str| {
            Selector::parse(css).map_err(|e| format!("Invalid selector '{}': {:?}", css, e))
        };
        Ok(Self {
            product: parse("article.product_pod")?,
            title: parse("h3 a[title]")?,
            price: parse(".price_color")?,
            availability: parse(".availability")?,
            rating: parse("p.star-rating")?,
            image: parse("img[src]")?,
            next: parse("li.next a[href]")?,
        })
    }
}

/// Parses a catalog listing page
///
/// # Extraction Rules
///
/// - Each `article.product_pod` is one entry
/// - Title and link come from the `h3 a[title]` anchor; entries without
///   one are skipped
/// - Rating is read from the word class on `p.star-rating` (`One`..`Five`)
/// - Relative links and image sources are resolved against `page_url`
/// - `li.next a` marks a further page
///
/// # Arguments
///
/// * `html` - The HTML content to parse
/// * `page_url` - URL the page was fetched from
///
/// # Returns
///
/// * `Ok(ParsedListing)` - Entries plus the pagination step
/// * `Err(String)` - Selectors could not be built
pub fn parse_listing(html: &str, page_url: &Url) -> Result<ParsedListing, String> {
    let selectors = ListingSelectors::new()?;
    let document = Html::parse_document(html);

    let items = document
        .select(&selectors.product)
        .filter_map(|product| extract_item(&product, &selectors, page_url))
        .collect();

    let next = document
        .select(&selectors.next)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| resolve(href, page_url))
        .and_then(|href| Url::parse(&href).ok())
        .map(PageStep::HasMore)
        .unwrap_or(PageStep::NoMore);

    Ok(ParsedListing { items, next })
}

fn extract_item(
    product: &ElementRef<'_>,
    selectors: &ListingSelectors,
    page_url: &Url,
) -> Option<ListingItem> {
    let anchor = product.select(&selectors.title).next()?;
    let title = anchor.value().attr("title")?.trim().to_string();
    if title.is_empty() {
        return None;
    }

    let url = anchor
        .value()
        .attr("href")
        .and_then(|href| resolve(href, page_url))
        .unwrap_or_default();

    let price = first_text(product, &selectors.price);
    let availability = first_text(product, &selectors.availability);

    let rating = product
        .select(&selectors.rating)
        .next()
        .and_then(|p| p.value().classes().find_map(rating_from_word));

    let image_url = product
        .select(&selectors.image)
        .next()
        .and_then(|img| img.value().attr("src"))
        .and_then(|src| resolve(src, page_url))
        .unwrap_or_default();

    Some(ListingItem {
        title,
        url,
        price,
        availability,
        rating,
        image_url,
    })
}

fn first_text(element: &ElementRef<'_>, selector: &Selector) -> String {
    element
        .select(selector)
        .next()
        .map(|e| {
            e.text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

fn rating_from_word(word: &str) -> Option<u8> {
    match word {
        "One" => Some(1),
        "Two" => Some(2),
        "Three" => Some(3),
        "Four" => Some(4),
        "Five" => Some(5),
        _ => None,
    }
}

/// Resolves an href against the page URL, keeping only HTTP(S) results
fn resolve(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    match base_url.join(href) {
        Ok(absolute_url) => {
            if absolute_url.scheme() == "http" || absolute_url.scheme() == "https" {
                Some(absolute_url.to_string())
            } else {
                None
            }
        }
        Err(_) => None,
    }
}
