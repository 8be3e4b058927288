//! QuakeML/StationXML-subset readers and a QuakeML-subset writer.
//!
//! These are deliberately narrow: enough of both schemas to carry events,
//! picks and station coordinates through the pipeline. Callers with richer
//! catalogs plug in their own implementations of the capability traits in
//! [`crate::catalog`].

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};
use tracing::debug;

use crate::catalog::{
    CatalogWriter, Event, EventReader, Origin, Phase, Pick, Station, StationReader,
};
use crate::error::{RelocError, Result};
use crate::geom;

fn is_tag(node: Node<'_, '_>, tag: &str) -> bool {
    node.is_element() && node.tag_name().name().eq_ignore_ascii_case(tag)
}

fn child<'a>(node: Node<'a, 'a>, tag: &str) -> Option<Node<'a, 'a>> {
    node.children().find(|n| is_tag(*n, tag))
}

fn child_text<'a>(node: Node<'a, 'a>, tag: &str) -> Option<&'a str> {
    child(node, tag).and_then(|n| n.text()).map(str::trim)
}

/// Text of `<tag><value>...</value></tag>`, the QuakeML quantity wrapper.
fn child_value<'a>(node: Node<'a, 'a>, tag: &str) -> Option<&'a str> {
    child(node, tag)
        .and_then(|n| child_text(n, "value"))
        .filter(|t| !t.is_empty())
}

fn parse_time(raw: &str, path: &Path) -> Result<DateTime<Utc>> {
    let attempt = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
    };
    attempt(raw)
        .or_else(|| attempt(&format!("{raw}Z")))
        .ok_or_else(|| RelocError::catalog(path, format!("unparsable time '{raw}'")))
}

fn parse_f64(raw: &str, what: &str, path: &Path) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| RelocError::catalog(path, format!("unparsable {what} '{raw}'")))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuakeMlReader;

impl QuakeMlReader {
    fn parse_origin(node: Node<'_, '_>, path: &Path) -> Result<Origin> {
        let time = child_value(node, "time")
            .ok_or_else(|| RelocError::catalog(path, "origin without time"))?;
        let latitude = child_value(node, "latitude")
            .ok_or_else(|| RelocError::catalog(path, "origin without latitude"))?;
        let longitude = child_value(node, "longitude")
            .ok_or_else(|| RelocError::catalog(path, "origin without longitude"))?;
        let depth = child_value(node, "depth")
            .ok_or_else(|| RelocError::catalog(path, "origin without depth"))?;
        Ok(Origin {
            time: parse_time(time, path)?,
            latitude_deg: parse_f64(latitude, "latitude", path)?,
            longitude_deg: parse_f64(longitude, "longitude", path)?,
            // QuakeML depth is meters; the pipeline works in kilometers.
            depth_km: geom::m_to_km(parse_f64(depth, "depth", path)?),
            method: "catalog".to_string(),
        })
    }

    fn parse_pick(node: Node<'_, '_>, path: &Path) -> Result<Option<Pick>> {
        let Some(phase) = child_text(node, "phaseHint").and_then(Phase::parse) else {
            // Picks with phases the engine does not take (Pg, pP, ...) are
            // simply not observations for this pipeline.
            return Ok(None);
        };
        let time = child_value(node, "time")
            .ok_or_else(|| RelocError::catalog(path, "pick without time"))?;
        let waveform = child(node, "waveformID")
            .ok_or_else(|| RelocError::catalog(path, "pick without waveformID"))?;
        let network = waveform.attribute("networkCode").unwrap_or("").trim();
        let station = waveform
            .attribute("stationCode")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RelocError::catalog(path, "pick without stationCode"))?;
        Ok(Some(Pick {
            station_id: format!("{network}.{station}"),
            phase,
            time: parse_time(time, path)?,
            weight: None,
        }))
    }

    fn parse_event(node: Node<'_, '_>, path: &Path) -> Result<Event> {
        let id = node
            .attribute("publicID")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RelocError::catalog(path, "event without publicID"))?
            .to_string();

        let mut origins = Vec::new();
        let mut origin_ids = Vec::new();
        let mut picks = Vec::new();
        for c in node.children() {
            if is_tag(c, "origin") {
                origin_ids.push(c.attribute("publicID").unwrap_or("").to_string());
                origins.push(Self::parse_origin(c, path)?);
            } else if is_tag(c, "pick") {
                if let Some(pick) = Self::parse_pick(c, path)? {
                    picks.push(pick);
                }
            }
        }
        if origins.is_empty() {
            return Err(RelocError::catalog(
                path,
                format!("event {id} has no origin"),
            ));
        }
        let preferred_origin = child_text(node, "preferredOriginID")
            .and_then(|wanted| origin_ids.iter().position(|oid| oid == wanted))
            .unwrap_or(0);

        let magnitude = child(node, "magnitude")
            .and_then(|m| child(m, "mag"))
            .and_then(|m| child_text(m, "value"))
            .and_then(|v| v.parse::<f64>().ok());

        Ok(Event {
            id,
            origins,
            preferred_origin,
            magnitude,
            picks,
        })
    }
}

impl EventReader for QuakeMlReader {
    fn read_events(&self, path: &Path) -> Result<Vec<Event>> {
        let xml = fs::read_to_string(path)?;
        let doc = Document::parse(&xml)
            .map_err(|e| RelocError::catalog(path, format!("invalid XML: {e}")))?;
        let events = doc
            .descendants()
            .filter(|n| is_tag(*n, "event"))
            .map(|n| QuakeMlReader::parse_event(n, path))
            .collect::<Result<Vec<_>>>()?;
        debug!(count = events.len(), "read events from {}", path.display());
        Ok(events)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StationXmlReader;

impl StationReader for StationXmlReader {
    fn read_stations(&self, path: &Path) -> Result<Vec<Station>> {
        let xml = fs::read_to_string(path)?;
        let doc = Document::parse(&xml)
            .map_err(|e| RelocError::catalog(path, format!("invalid XML: {e}")))?;
        let mut stations = Vec::new();
        for network in doc.descendants().filter(|n| is_tag(*n, "network")) {
            let network_code = network.attribute("code").unwrap_or("").trim().to_string();
            for node in network.descendants().filter(|n| is_tag(*n, "station")) {
                let code = node
                    .attribute("code")
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| RelocError::catalog(path, "station without code"))?;
                let latitude = child_text(node, "latitude")
                    .ok_or_else(|| RelocError::catalog(path, "station without latitude"))?;
                let longitude = child_text(node, "longitude")
                    .ok_or_else(|| RelocError::catalog(path, "station without longitude"))?;
                let elevation = child_text(node, "elevation")
                    .ok_or_else(|| RelocError::catalog(path, "station without elevation"))?;
                stations.push(Station {
                    network: network_code.clone(),
                    code: code.to_string(),
                    latitude_deg: parse_f64(latitude, "latitude", path)?,
                    longitude_deg: parse_f64(longitude, "longitude", path)?,
                    elevation_m: parse_f64(elevation, "elevation", path)?,
                });
            }
        }
        debug!(
            count = stations.len(),
            "read stations from {}",
            path.display()
        );
        Ok(stations)
    }
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuakeMlWriter;

impl CatalogWriter for QuakeMlWriter {
    fn write_events(&self, events: &[Event], path: &Path) -> Result<()> {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<q:quakeml xmlns:q=\"http://quakeml.org/xmlns/quakeml/1.2\" xmlns=\"http://quakeml.org/xmlns/bed/1.2\">\n");
        out.push_str("  <eventParameters publicID=\"smi:local/catalog\">\n");
        for event in events {
            let event_id = xml_escape(&event.id);
            out.push_str(&format!("    <event publicID=\"{event_id}\">\n"));
            out.push_str(&format!(
                "      <preferredOriginID>{event_id}/origin/{}</preferredOriginID>\n",
                event.preferred_origin
            ));
            for (i, origin) in event.origins.iter().enumerate() {
                out.push_str(&format!(
                    "      <origin publicID=\"{event_id}/origin/{i}\">\n"
                ));
                out.push_str(&format!(
                    "        <time><value>{}</value></time>\n",
                    format_time(&origin.time)
                ));
                out.push_str(&format!(
                    "        <latitude><value>{:.6}</value></latitude>\n",
                    origin.latitude_deg
                ));
                out.push_str(&format!(
                    "        <longitude><value>{:.6}</value></longitude>\n",
                    origin.longitude_deg
                ));
                out.push_str(&format!(
                    "        <depth><value>{:.1}</value></depth>\n",
                    geom::km_to_m(origin.depth_km)
                ));
                out.push_str(&format!(
                    "        <methodID>smi:local/method/{}</methodID>\n",
                    xml_escape(&origin.method)
                ));
                out.push_str("      </origin>\n");
            }
            if let Some(magnitude) = event.magnitude {
                out.push_str(&format!(
                    "      <magnitude publicID=\"{event_id}/magnitude\"><mag><value>{magnitude:.2}</value></mag></magnitude>\n"
                ));
            }
            for (i, pick) in event.picks.iter().enumerate() {
                let (network, station) = pick
                    .station_id
                    .split_once('.')
                    .unwrap_or(("", pick.station_id.as_str()));
                out.push_str(&format!("      <pick publicID=\"{event_id}/pick/{i}\">\n"));
                out.push_str(&format!(
                    "        <time><value>{}</value></time>\n",
                    format_time(&pick.time)
                ));
                out.push_str(&format!(
                    "        <waveformID networkCode=\"{}\" stationCode=\"{}\"/>\n",
                    xml_escape(network),
                    xml_escape(station)
                ));
                out.push_str(&format!(
                    "        <phaseHint>{}</phaseHint>\n",
                    pick.phase.as_str()
                ));
                out.push_str("      </pick>\n");
            }
            out.push_str("    </event>\n");
        }
        out.push_str("  </eventParameters>\n");
        out.push_str("</q:quakeml>\n");
        fs::write(path, out)?;
        debug!(count = events.len(), "wrote catalog to {}", path.display());
        Ok(())
    }
}
