use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use fleetfw_domain::CatalogEntry;
use flate2::read::GzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::CatalogError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// ── Fetch ─────────────────────────────────────────────────────────────────────

/// Download and parse a Dell catalog. Gzipped bodies are detected by magic
/// bytes, not by URL suffix or Content-Type.
pub async fn fetch_catalog(
    client: &reqwest::Client,
    url: &str,
) -> Result<Vec<CatalogEntry>, CatalogError> {
    let resp = client.get(url).send().await.map_err(|e| CatalogError::Fetch {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    let status = resp.status();
    if !status.is_success() {
        return Err(CatalogError::Fetch {
            url: url.to_string(),
            message: format!("server returned {}", status),
        });
    }
    let bytes = resp.bytes().await.map_err(|e| CatalogError::Fetch {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    let entries = parse_catalog_bytes(&bytes, url)?;
    info!(%url, entries = entries.len(), "catalog fetched");
    Ok(entries)
}

/// Decode (gunzipping if needed) and parse catalog bytes.
pub fn parse_catalog_bytes(bytes: &[u8], base_url: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
    let xml = if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = String::new();
        decoder
            .read_to_string(&mut out)
            .map_err(|e| CatalogError::Parse(format!("gunzip failed: {}", e)))?;
        out
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };
    parse_catalog_xml(&xml, base_url)
}

// ── XML parsing ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct PartialComponent {
    id: Option<String>,
    component_type: Option<String>,
    version: Option<String>,
    path: Option<String>,
    release_date: Option<String>,
    models: Vec<String>,
}

/// Parse catalog XML. Tolerates both `Manifest/SoftwareComponent` and
/// `Catalog/SoftwareComponent` roots, and component metadata expressed as
/// attributes or as child elements (Dell has shipped both shapes).
pub fn parse_catalog_xml(xml: &str, base_url: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut root_checked = false;
    let mut current: Option<PartialComponent> = None;
    let mut in_display = false;

    loop {
        match reader
            .read_event()
            .map_err(|e| CatalogError::Parse(e.to_string()))?
        {
            Event::Start(e) => {
                let name = e.name();
                let name = name.as_ref();
                if !root_checked {
                    check_root(name)?;
                    root_checked = true;
                    continue;
                }
                match name {
                    b"SoftwareComponent" => {
                        let mut partial = PartialComponent::default();
                        read_component_attrs(&e, &mut partial)?;
                        current = Some(partial);
                    }
                    b"ComponentType" => {
                        if let Some(p) = current.as_mut() {
                            if let Some(v) = attr_value(&e, b"value")? {
                                p.component_type.get_or_insert(v);
                            }
                        }
                    }
                    b"Model" => {
                        if let Some(p) = current.as_mut() {
                            if let Some(v) =
                                attr_value(&e, b"name")?.or(attr_value(&e, b"systemID")?)
                            {
                                p.models.push(v);
                            }
                        }
                    }
                    b"Display" => in_display = current.is_some(),
                    _ => {}
                }
            }
            Event::Empty(e) => {
                let name = e.name();
                let name = name.as_ref();
                if !root_checked {
                    check_root(name)?;
                    root_checked = true;
                    continue;
                }
                match name {
                    // A self-closing component is complete as soon as its
                    // attributes are read.
                    b"SoftwareComponent" if current.is_none() => {
                        let mut partial = PartialComponent::default();
                        read_component_attrs(&e, &mut partial)?;
                        if let Some(entry) = finish_component(partial, base_url) {
                            entries.push(entry);
                        }
                    }
                    b"ComponentType" => {
                        if let Some(p) = current.as_mut() {
                            if let Some(v) = attr_value(&e, b"value")? {
                                p.component_type.get_or_insert(v);
                            }
                        }
                    }
                    b"Model" => {
                        if let Some(p) = current.as_mut() {
                            if let Some(v) =
                                attr_value(&e, b"name")?.or(attr_value(&e, b"systemID")?)
                            {
                                p.models.push(v);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                if in_display {
                    if let Some(p) = current.as_mut() {
                        let text = t
                            .unescape()
                            .map_err(|e| CatalogError::Parse(e.to_string()))?
                            .trim()
                            .to_string();
                        if !text.is_empty() && !p.models.contains(&text) {
                            p.models.push(text);
                        }
                    }
                }
            }
            Event::CData(t) => {
                if in_display {
                    if let Some(p) = current.as_mut() {
                        let text = String::from_utf8_lossy(&t).trim().to_string();
                        if !text.is_empty() && !p.models.contains(&text) {
                            p.models.push(text);
                        }
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"SoftwareComponent" => {
                    if let Some(p) = current.take() {
                        if let Some(entry) = finish_component(p, base_url) {
                            entries.push(entry);
                        }
                    }
                }
                b"Display" => in_display = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    debug!(entries = entries.len(), "catalog parsed");
    Ok(entries)
}

fn check_root(name: &[u8]) -> Result<(), CatalogError> {
    if name != b"Manifest" && name != b"Catalog" {
        return Err(CatalogError::Parse(format!(
            "unrecognized catalog root element '{}'",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

fn read_component_attrs(
    e: &BytesStart<'_>,
    partial: &mut PartialComponent,
) -> Result<(), CatalogError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| CatalogError::Parse(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| CatalogError::Parse(e.to_string()))?
            .into_owned();
        match attr.key.as_ref() {
            b"packageID" => partial.id = Some(value),
            b"ComponentType" | b"componentType" => partial.component_type = Some(value),
            b"version" | b"vendorVersion" => partial.version = Some(value),
            b"path" => partial.path = Some(value),
            b"releaseDate" | b"dateTime" => partial.release_date = Some(value),
            _ => {}
        }
    }
    Ok(())
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, CatalogError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| CatalogError::Parse(e.to_string()))?;
        if attr.key.as_ref() == key {
            return Ok(Some(
                attr.unescape_value()
                    .map_err(|e| CatalogError::Parse(e.to_string()))?
                    .into_owned(),
            ));
        }
    }
    Ok(None)
}

fn finish_component(partial: PartialComponent, base_url: &str) -> Option<CatalogEntry> {
    let component_type = partial.component_type?;
    let path = partial.path?;
    let url = resolve_url(base_url, &path);
    let id = partial
        .id
        .unwrap_or_else(|| path.rsplit('/').next().unwrap_or(&path).to_string());
    Some(CatalogEntry {
        id,
        component_type,
        version: partial.version.unwrap_or_default(),
        url,
        supported_models: partial.models,
        release_date: partial.release_date.as_deref().and_then(parse_release_date),
    })
}

fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    match reqwest::Url::parse(base_url).and_then(|b| b.join(path)) {
        Ok(joined) => joined.to_string(),
        Err(_) => format!("https://downloads.dell.com/{}", path.trim_start_matches('/')),
    }
}

fn parse_release_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%B %d, %Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
        }
    }
    None
}

// ── Selection ─────────────────────────────────────────────────────────────────

/// Pick the newest catalog entry for a component type, optionally narrowed
/// by a model substring. Release date descending; equal dates are broken by
/// version, numeric-aware.
pub fn find_latest<'a>(
    entries: &'a [CatalogEntry],
    component_type: &str,
    model: Option<&str>,
) -> Option<&'a CatalogEntry> {
    let mut matches: Vec<&CatalogEntry> = entries
        .iter()
        .filter(|e| e.component_type.eq_ignore_ascii_case(component_type))
        .filter(|e| match model {
            None => true,
            Some(m) => {
                e.supported_models.is_empty()
                    || e.supported_models
                        .iter()
                        .any(|s| s.to_ascii_lowercase().contains(&m.to_ascii_lowercase()))
            }
        })
        .collect();

    matches.sort_by(|a, b| {
        b.release_date
            .cmp(&a.release_date)
            .then_with(|| compare_versions(&b.version, &a.version))
    });
    matches.into_iter().next()
}

/// Segment-wise version comparison: numeric segments compare numerically,
/// everything else lexicographically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |s: &str| -> Vec<String> {
        s.split(['.', '-', '_'])
            .map(str::to_string)
            .collect()
    };
    let (sa, sb) = (split(a), split(b));
    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    sa.len().cmp(&sb.len())
}

// ── Cache ─────────────────────────────────────────────────────────────────────

struct CachedCatalog {
    fetched_at: Instant,
    entries: Arc<Vec<CatalogEntry>>,
}

/// URL-keyed catalog cache with a TTL (default 30 min). Process-wide,
/// single writer per key.
pub struct CatalogCache {
    client: reqwest::Client,
    ttl: Duration,
    inner: RwLock<HashMap<String, CachedCatalog>>,
}

impl CatalogCache {
    pub fn new(client: reqwest::Client, ttl: Duration) -> Self {
        CatalogCache {
            client,
            ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Cached entries for `url`, fetching when absent or expired.
    pub async fn get(&self, url: &str) -> Result<Arc<Vec<CatalogEntry>>, CatalogError> {
        {
            let guard = self.inner.read().await;
            if let Some(cached) = guard.get(url) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.entries.clone());
                }
            }
        }

        let entries = Arc::new(fetch_catalog(&self.client, url).await?);
        let mut guard = self.inner.write().await;
        guard.insert(
            url.to_string(),
            CachedCatalog {
                fetched_at: Instant::now(),
                entries: entries.clone(),
            },
        );
        Ok(entries)
    }

    /// Drop a cached catalog, forcing the next `get` to refetch.
    pub async fn invalidate(&self, url: &str) {
        self.inner.write().await.remove(url);
    }
}
