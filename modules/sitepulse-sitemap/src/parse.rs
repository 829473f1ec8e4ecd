use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;

use sitepulse_common::{DiscoveredUrl, Result, SitemapKind, SitepulseError};

use crate::ParsedSitemap;

/// Parse a sitemap body of any supported flavor: `<sitemapindex>`,
/// `<urlset>`, RSS 2.0, Atom, or a bare URL-per-line text file.
///
/// On a mid-stream XML error, whatever was extracted so far is returned
/// with a warning; the parse only fails when nothing useful came out.
pub fn parse_sitemap(source_url: &str, body: &str) -> Result<ParsedSitemap> {
    let trimmed = body.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Err(SitepulseError::InvalidSitemap(format!(
            "{source_url}: empty document"
        )));
    }

    if !trimmed.starts_with('<') {
        return parse_plain_text(source_url, trimmed);
    }

    match detect_root(trimmed) {
        Some(b"sitemapindex") => parse_xml(source_url, trimmed, SitemapKind::Index),
        Some(b"urlset") => parse_xml(source_url, trimmed, SitemapKind::Urlset),
        Some(b"rss") | Some(b"feed") => parse_feed(source_url, trimmed),
        _ => Err(SitepulseError::InvalidSitemap(format!(
            "{source_url}: unrecognized root element"
        ))),
    }
}

fn detect_root(body: &str) -> Option<&[u8]> {
    let mut reader = Reader::from_str(body);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                return match name {
                    b"sitemapindex" => Some(b"sitemapindex"),
                    b"urlset" => Some(b"urlset"),
                    b"rss" => Some(b"rss"),
                    b"feed" => Some(b"feed"),
                    _ => None,
                };
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

fn parse_xml(source_url: &str, body: &str, kind: SitemapKind) -> Result<ParsedSitemap> {
    let mut reader = Reader::from_str(body);
    let mut parsed = ParsedSitemap {
        kind: Some(kind),
        ..Default::default()
    };

    // Element currently collecting text, and the entry under construction.
    let mut field: Option<Field> = None;
    let mut in_entry = false;
    let mut loc = String::new();
    let mut lastmod = None;
    let mut changefreq = None;
    let mut priority = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"url" | b"sitemap" => {
                    in_entry = true;
                    loc.clear();
                    lastmod = None;
                    changefreq = None;
                    priority = None;
                }
                b"loc" if in_entry => field = Some(Field::Loc),
                b"lastmod" if in_entry => field = Some(Field::Lastmod),
                b"changefreq" if in_entry => field = Some(Field::Changefreq),
                b"priority" if in_entry => field = Some(Field::Priority),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if let Some(ref f) = field {
                    let text = match e.unescape() {
                        Ok(t) => t.trim().to_string(),
                        Err(_) => continue,
                    };
                    apply_field(f, &text, &mut loc, &mut lastmod, &mut changefreq, &mut priority);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(ref f) = field {
                    let text = String::from_utf8_lossy(&e).trim().to_string();
                    apply_field(f, &text, &mut loc, &mut lastmod, &mut changefreq, &mut priority);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"url" | b"sitemap" => {
                    in_entry = false;
                    field = None;
                    if loc.is_empty() {
                        continue;
                    }
                    match kind {
                        SitemapKind::Index => parsed.child_sitemaps.push(loc.clone()),
                        _ => parsed.urls.push(DiscoveredUrl {
                            loc: loc.clone(),
                            lastmod,
                            changefreq: changefreq.take(),
                            priority,
                        }),
                    }
                }
                b"loc" | b"lastmod" | b"changefreq" | b"priority" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                if parsed.is_empty() {
                    return Err(SitepulseError::InvalidSitemap(format!(
                        "{source_url}: XML error at byte {}: {e}",
                        reader.buffer_position()
                    )));
                }
                warn!(
                    url = source_url,
                    error = %e,
                    extracted = parsed.urls.len() + parsed.child_sitemaps.len(),
                    "Sitemap truncated mid-parse; keeping extracted entries"
                );
                break;
            }
        }
    }

    Ok(parsed)
}

enum Field {
    Loc,
    Lastmod,
    Changefreq,
    Priority,
}

fn apply_field(
    field: &Field,
    text: &str,
    loc: &mut String,
    lastmod: &mut Option<DateTime<Utc>>,
    changefreq: &mut Option<String>,
    priority: &mut Option<f32>,
) {
    if text.is_empty() {
        return;
    }
    match field {
        Field::Loc => loc.push_str(text),
        Field::Lastmod => *lastmod = parse_lastmod(text),
        Field::Changefreq => *changefreq = Some(text.to_string()),
        Field::Priority => *priority = text.parse().ok(),
    }
}

/// W3C datetime: full RFC 3339 or a bare date.
fn parse_lastmod(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// RSS 2.0 and Atom documents, via feed-rs. `item/link` text for RSS,
/// `entry/link/@href` for Atom.
fn parse_feed(source_url: &str, body: &str) -> Result<ParsedSitemap> {
    let feed = feed_rs::parser::parse(body.as_bytes())
        .map_err(|e| SitepulseError::InvalidSitemap(format!("{source_url}: feed parse: {e}")))?;

    let urls = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let loc = entry
                .links
                .first()
                .map(|l| l.href.trim().to_string())
                .filter(|href| !href.is_empty())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))?;
            let lastmod = entry
                .published
                .or(entry.updated)
                .map(|dt| dt.with_timezone(&Utc));
            Some(DiscoveredUrl {
                loc,
                lastmod,
                changefreq: None,
                priority: None,
            })
        })
        .collect();

    Ok(ParsedSitemap {
        kind: Some(SitemapKind::Rss),
        urls,
        child_sitemaps: Vec::new(),
    })
}

/// Some sites publish sitemaps as one URL per line.
fn parse_plain_text(source_url: &str, body: &str) -> Result<ParsedSitemap> {
    let urls: Vec<DiscoveredUrl> = body
        .split_whitespace()
        .filter(|token| url::Url::parse(token).is_ok())
        .map(DiscoveredUrl::new)
        .collect();

    if urls.is_empty() {
        return Err(SitepulseError::InvalidSitemap(format!(
            "{source_url}: no URLs in plain-text body"
        )));
    }
    Ok(ParsedSitemap {
        kind: Some(SitemapKind::Urlset),
        urls,
        child_sitemaps: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urlset() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url>
    <loc> https://example.com/page </loc>
    <lastmod>2024-05-01</lastmod>
    <changefreq>daily</changefreq>
    <priority>0.8</priority>
  </url>
  <url><loc>https://example.com/other</loc></url>
</urlset>"#;
        let parsed = parse_sitemap("http://t/sm.xml", xml).unwrap();
        assert_eq!(parsed.kind, Some(SitemapKind::Urlset));
        assert_eq!(parsed.urls.len(), 2);
        assert!(parsed.child_sitemaps.is_empty());

        let first = &parsed.urls[0];
        assert_eq!(first.loc, "https://example.com/page");
        assert_eq!(first.changefreq.as_deref(), Some("daily"));
        assert_eq!(first.priority, Some(0.8));
        assert_eq!(
            first.lastmod.unwrap().date_naive(),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
    }

    #[test]
    fn test_parse_sitemapindex() {
        let xml = r#"<sitemapindex>
  <sitemap><loc>http://t/a.xml</loc></sitemap>
  <sitemap><loc>http://t/b.xml</loc></sitemap>
</sitemapindex>"#;
        let parsed = parse_sitemap("http://t/sm.xml", xml).unwrap();
        assert_eq!(parsed.kind, Some(SitemapKind::Index));
        assert_eq!(
            parsed.child_sitemaps,
            vec!["http://t/a.xml", "http://t/b.xml"]
        );
        assert!(parsed.urls.is_empty());
    }

    #[test]
    fn test_empty_loc_dropped() {
        let xml = r#"<urlset>
  <url><loc></loc></url>
  <url><loc>   </loc></url>
  <url><loc>https://example.com/kept</loc></url>
</urlset>"#;
        let parsed = parse_sitemap("http://t/sm.xml", xml).unwrap();
        assert_eq!(parsed.urls.len(), 1);
        assert_eq!(parsed.urls[0].loc, "https://example.com/kept");
    }

    #[test]
    fn test_entity_unescaped_in_loc() {
        let xml = r#"<urlset><url><loc>https://example.com/p?a=1&amp;b=2</loc></url></urlset>"#;
        let parsed = parse_sitemap("http://t/sm.xml", xml).unwrap();
        assert_eq!(parsed.urls[0].loc, "https://example.com/p?a=1&b=2");
    }

    #[test]
    fn test_parse_rss() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Blog</title>
    <item><title>One</title><link>https://example.com/one</link></item>
    <item><title>Two</title><link>https://example.com/two</link></item>
  </channel>
</rss>"#;
        let parsed = parse_sitemap("http://t/feed.xml", xml).unwrap();
        assert_eq!(parsed.kind, Some(SitemapKind::Rss));
        let locs: Vec<&str> = parsed.urls.iter().map(|u| u.loc.as_str()).collect();
        assert_eq!(locs, vec!["https://example.com/one", "https://example.com/two"]);
    }

    #[test]
    fn test_parse_atom() {
        let xml = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Blog</title>
  <entry>
    <title>One</title>
    <link href="https://example.com/atom-one"/>
    <id>urn:uuid:1</id>
  </entry>
</feed>"#;
        let parsed = parse_sitemap("http://t/atom.xml", xml).unwrap();
        assert_eq!(parsed.kind, Some(SitemapKind::Rss));
        assert_eq!(parsed.urls[0].loc, "https://example.com/atom-one");
    }

    #[test]
    fn test_plain_text_fallback() {
        let body = "https://example.com/a\nhttps://example.com/b\nnot a url\n";
        let parsed = parse_sitemap("http://t/urls.txt", body).unwrap();
        assert_eq!(parsed.kind, Some(SitemapKind::Urlset));
        assert_eq!(parsed.urls.len(), 2);
    }

    #[test]
    fn test_truncated_urlset_keeps_extracted() {
        let xml = r#"<urlset>
  <url><loc>https://example.com/first</loc></url>
  <url><loc>https://example.com/second</loc>"#;
        let parsed = parse_sitemap("http://t/sm.xml", xml).unwrap();
        assert!(!parsed.urls.is_empty());
        assert_eq!(parsed.urls[0].loc, "https://example.com/first");
    }

    #[test]
    fn test_garbage_fails() {
        assert!(parse_sitemap("http://t/sm.xml", "<html><body>404</body></html>").is_err());
        assert!(parse_sitemap("http://t/sm.xml", "").is_err());
    }

    #[test]
    fn test_lastmod_rfc3339() {
        let ts = parse_lastmod("2024-05-01T12:30:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:30:00+00:00");
        assert!(parse_lastmod("not a date").is_none());
    }
}
