use anyhow::{anyhow, Result};
use regex::Regex;
use scraper::{Html, Selector};

/// Reads the page count out of a listing's pagination control
#[derive(Debug)]
pub struct PaginationReader {
    links: Selector,
    page_param: Regex,
}

impl PaginationReader {
    pub fn new(link_selector: &str) -> Result<Self> {
        let links = Selector::parse(link_selector)
            .map_err(|e| anyhow!("Invalid pagination selector '{}': {:?}", link_selector, e))?;
        let page_param = Regex::new(r"[?&]p=(\d+)")?;

        Ok(Self { links, page_param })
    }

    /// Highest `p=<n>` among the pagination links, if there are any
    pub fn last_page(&self, html: &str) -> Option<u32> {
        let document = Html::parse_document(html);

        document.select(&self.links)
            .filter_map(|link| link.value().attr("href"))
            .filter_map(|href| self.page_param.captures(href))
            .filter_map(|caps| caps[1].parse::<u32>().ok())
            .filter(|page| *page > 0)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> PaginationReader {
        PaginationReader::new("div.pagination a").unwrap()
    }

    #[test]
    fn test_last_page_from_links() {
        let html = r#"
            <div class="pagination">
              <a href="/payouts?p=2">2</a>
              <a href="/payouts?p=3">3</a>
              <a href="/payouts?sort=new&p=148">&raquo;</a>
            </div>"#;
        assert_eq!(reader().last_page(html), Some(148));
    }

    #[test]
    fn test_missing_or_unparseable_pagination() {
        assert_eq!(reader().last_page("<p>no pages here</p>"), None);
        assert_eq!(reader().last_page(r#"<div class="pagination"><a href="/next">next</a></div>"#), None);
    }

    #[test]
    fn test_links_outside_control_are_ignored() {
        let html = r#"<a href="/payouts?p=99">elsewhere</a><div class="pagination"><a href="?p=4">4</a></div>"#;
        assert_eq!(reader().last_page(html), Some(4));
    }
}
