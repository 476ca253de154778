//! Caltrans KML layers (lane closures, chain controls, CMS, ...). Each layer
//! URL is fetched and its placemarks within `max_km` are forwarded.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};

use super::{fetch::get_with_retry, forward_if_new, Poster, Source};
use crate::config::{Location, SourceConfig};
use crate::context::AppContext;
use crate::dedup::{fingerprint, SeenStore};
use crate::notify::into_item;
use crate::util::{float_text, km_between, round1};

pub const BUCKET: &str = "caltrans";
const KML_ACCEPT: &str = "application/vnd.google-earth.kml+xml, application/xml, text/xml";

#[derive(Debug, Clone, Deserialize)]
pub struct CaltransParams {
    #[serde(default = "default_max_km")]
    pub max_km: f64,
    /// layer name -> KML URL
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub layer_filter_prefix: Option<String>,
}

fn default_max_km() -> f64 {
    80.0
}

/// One KML placemark reduced to what gets forwarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placemark {
    pub name: Option<String>,
    pub description: Option<String>,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
}

#[derive(Default)]
struct PlacemarkBuilder {
    name: Option<String>,
    description: Option<String>,
    point: Option<String>,
    line: Option<String>,
    polygon: Option<String>,
}

impl PlacemarkBuilder {
    fn finish(self) -> Placemark {
        let coords = self.point.or(self.line).or(self.polygon);
        let (lon, lat) = coords
            .as_deref()
            .and_then(first_coordinate)
            .map_or((None, None), |(lon, lat)| (Some(lon), Some(lat)));
        let description = self
            .description
            .map(|d| html_escape::decode_html_entities(&d).replace(['\n', '\r'], " "));
        Placemark {
            name: self.name,
            description,
            lon,
            lat,
        }
    }
}

/// `lon,lat[,alt]` of the first tuple in a KML coordinates string.
fn first_coordinate(text: &str) -> Option<(f64, f64)> {
    let first = text.split_whitespace().next()?;
    let mut parts = first.split(',');
    let lon = parts.next()?.trim().parse().ok()?;
    let lat = parts.next()?.trim().parse().ok()?;
    Some((lon, lat))
}

fn non_blank(s: String) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

/// Every `Placemark` in the document, at any depth, namespaced or not.
pub fn parse_kml(xml: &str) -> Result<Vec<Placemark>> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    // element names below the current Placemark (empty when outside one)
    let mut path: Vec<String> = Vec::new();
    let mut current: Option<PlacemarkBuilder> = None;
    let mut text = String::new();

    loop {
        let event = reader
            .read_event()
            .with_context(|| format!("KML parse error at byte {}", reader.buffer_position()))?;
        match event {
            Event::Start(e) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if current.is_some() {
                    path.push(local);
                } else if local == "Placemark" {
                    current = Some(PlacemarkBuilder::default());
                }
                text.clear();
            }
            Event::Text(t) => {
                if current.is_some() {
                    let raw = String::from_utf8_lossy(&t).into_owned();
                    text.push_str(&html_escape::decode_html_entities(&raw));
                }
            }
            Event::CData(c) => {
                if current.is_some() {
                    text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(e) => {
                let Some(pm) = current.as_mut() else {
                    continue;
                };
                let local = e.local_name();
                if path.is_empty() && local.as_ref() == b"Placemark" {
                    if let Some(done) = current.take() {
                        out.push(done.finish());
                    }
                    continue;
                }
                let value = std::mem::take(&mut text);
                match (path.len(), path.last().map(String::as_str)) {
                    (1, Some("name")) => pm.name = non_blank(value),
                    (1, Some("description")) => pm.description = non_blank(value),
                    (_, Some("coordinates")) => {
                        let parent = path.iter().rev().nth(1).map(String::as_str);
                        let in_polygon = path.iter().any(|p| p == "Polygon");
                        if parent == Some("Point") && pm.point.is_none() {
                            pm.point = non_blank(value);
                        } else if parent == Some("LineString") && pm.line.is_none() {
                            pm.line = non_blank(value);
                        } else if in_polygon && pm.polygon.is_none() {
                            pm.polygon = non_blank(value);
                        }
                    }
                    _ => {}
                }
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

pub struct Caltrans {
    name: String,
    params: CaltransParams,
    location: Location,
    http: Client,
    poster: Poster,
}

impl Caltrans {
    pub fn from_config(cfg: &SourceConfig, ctx: &AppContext) -> Result<Self> {
        Ok(Self {
            name: cfg.display_name(),
            params: cfg.params_as()?,
            location: ctx.general.location()?,
            http: ctx.http.clone(),
            poster: Poster::from_config(cfg, ctx),
        })
    }

    fn wants_layer(&self, layer: &str) -> bool {
        match self.params.layer_filter_prefix.as_deref().map(str::trim) {
            Some(prefix) if !prefix.is_empty() => layer.starts_with(prefix),
            _ => true,
        }
    }

    async fn poll_layer(&self, layer: &str, url: &str, seen: &mut SeenStore) -> Result<usize> {
        let body = get_with_retry(&self.http, url, &[("Accept", KML_ACCEPT)], &[])
            .await?
            .text()
            .await
            .context("reading KML body")?;

        let mut new_count = 0;
        for pm in parse_kml(&body)? {
            let (Some(lat), Some(lon)) = (pm.lat, pm.lon) else {
                continue;
            };
            let d = km_between(self.location.lat, self.location.lon, lat, lon);
            if d > self.params.max_km {
                continue;
            }
            let fp = fingerprint(
                BUCKET,
                &[
                    layer.to_string(),
                    pm.name.clone().unwrap_or_else(|| "None".to_string()),
                    float_text(lat),
                    float_text(lon),
                ],
            );
            let item = json!({
                "name": pm.name,
                "description": pm.description,
                "lon": lon,
                "lat": lat,
                "distance_km": round1(d),
                "layer": layer,
            });
            if forward_if_new(seen, BUCKET, &fp, &self.poster, into_item(item)).await {
                new_count += 1;
            }
        }
        Ok(new_count)
    }
}

#[async_trait]
impl Source for Caltrans {
    fn name(&self) -> &str {
        &self.name
    }

    fn bucket(&self) -> &'static str {
        BUCKET
    }

    async fn poll(&mut self, _now: DateTime<Utc>, seen: &mut SeenStore) -> Result<usize> {
        let mut new_count = 0;
        for (layer, url) in &self.params.endpoints {
            if !self.wants_layer(layer) {
                continue;
            }
            // one bad layer must not hide the others
            match self.poll_layer(layer, url, seen).await {
                Ok(n) => new_count += n,
                Err(e) => error!(source = %self.name, %layer, error = ?e, "layer poll failed"),
            }
        }
        if new_count > 0 {
            info!(source = %self.name, new_count, "new Caltrans items");
        } else {
            debug!(source = %self.name, "no new Caltrans items");
        }
        Ok(new_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <Folder>
      <Placemark>
        <name>SR-17 NB Closure</name>
        <description><![CDATA[<b>Lane</b> closed&amp;
next line]]></description>
        <Point><coordinates>-121.98,37.22,0</coordinates></Point>
      </Placemark>
      <Placemark>
        <name> I-80 Chain Control </name>
        <description>R1 &amp; R2 in effect</description>
        <LineString><coordinates>
          -120.5,39.3,0 -120.4,39.31,0
        </coordinates></LineString>
      </Placemark>
      <Placemark>
        <name>Area</name>
        <Polygon><outerBoundaryIs><LinearRing>
          <coordinates>-122.0,37.5 -122.1,37.6 -122.0,37.5</coordinates>
        </LinearRing></outerBoundaryIs></Polygon>
      </Placemark>
      <Placemark><name>Nowhere</name></Placemark>
    </Folder>
  </Document>
</kml>"#;

    #[test]
    fn parses_points_lines_and_polygons() {
        let pms = parse_kml(KML).unwrap();
        assert_eq!(pms.len(), 4);

        assert_eq!(pms[0].name.as_deref(), Some("SR-17 NB Closure"));
        assert_eq!(pms[0].description.as_deref(), Some("<b>Lane</b> closed& next line"));
        assert_eq!((pms[0].lon, pms[0].lat), (Some(-121.98), Some(37.22)));

        assert_eq!(pms[1].name.as_deref(), Some("I-80 Chain Control"));
        assert_eq!(pms[1].description.as_deref(), Some("R1 & R2 in effect"));
        assert_eq!((pms[1].lon, pms[1].lat), (Some(-120.5), Some(39.3)));

        assert_eq!((pms[2].lon, pms[2].lat), (Some(-122.0), Some(37.5)));

        assert_eq!(pms[3], Placemark { name: Some("Nowhere".into()), ..Default::default() });
    }

    #[test]
    fn prefixed_namespace_is_matched_by_local_name() {
        let xml = r#"<k:kml xmlns:k="http://www.opengis.net/kml/2.2"><k:Placemark><k:name>X</k:name>
            <k:Point><k:coordinates>1.5,2.5</k:coordinates></k:Point></k:Placemark></k:kml>"#;
        let pms = parse_kml(xml).unwrap();
        assert_eq!(pms.len(), 1);
        assert_eq!(pms[0].name.as_deref(), Some("X"));
        assert_eq!((pms[0].lon, pms[0].lat), (Some(1.5), Some(2.5)));
    }

    #[test]
    fn bad_coordinates_are_absent() {
        assert_eq!(first_coordinate("abc,def"), None);
        assert_eq!(first_coordinate("5"), None);
        assert_eq!(first_coordinate("  1,2,3 4,5"), Some((1.0, 2.0)));
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_kml("<kml><Placemark><name>x</Placemark></kml>").is_err());
    }
}
