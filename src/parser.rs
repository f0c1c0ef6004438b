use crate::model::{BoundingBox, Changeset, ChangesetComment};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::io::BufRead;
use thiserror::Error;

/// Fatal stream-level parse failures. Per-element problems are logged and the
/// element is skipped; these abort the whole parse.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("xml stream error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("unexpected end of document inside a changeset element")]
    UnexpectedEof,
}

/// Optional inclusive filter on `created_at`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateWindow {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        if let Some(from) = self.from {
            if t < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if t > to {
                return false;
            }
        }
        true
    }
}

/// Incremental changeset decoder over any byte stream.
///
/// Memory use is bounded by the size of the current element, not the
/// document; the multi-gigabyte archive flows through this same reader.
pub struct ChangesetReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    body_buf: Vec<u8>,
    window: DateWindow,
    done: bool,
}

impl<R: BufRead> ChangesetReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_window(source, DateWindow::default())
    }

    pub fn with_window(source: R, window: DateWindow) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text_start = true;
        reader.config_mut().trim_text_end = true;
        Self {
            reader,
            buf: Vec::new(),
            body_buf: Vec::new(),
            window,
            done: false,
        }
    }

    fn read_next(&mut self) -> Result<Option<Changeset>, ParseError> {
        loop {
            self.buf.clear();
            // Classify the event into owned data before touching self again:
            // the event borrows the read buffer.
            let header = match self.reader.read_event_into(&mut self.buf)? {
                Event::Empty(e) if e.name().as_ref() == b"changeset" => {
                    let Some(mut cs) = parse_header(&e) else {
                        continue;
                    };
                    cs.comments_count = cs.comments_count.max(cs.comments.len() as i32);
                    if self.window.contains(cs.created_at) {
                        return Ok(Some(cs));
                    }
                    continue;
                }
                Event::Start(e) if e.name().as_ref() == b"changeset" => parse_header(&e),
                Event::Eof => return Ok(None),
                _ => continue,
            };

            match header {
                Some(mut cs) => {
                    self.read_body(&mut cs)?;
                    cs.comments_count = cs.comments_count.max(cs.comments.len() as i32);
                    if self.window.contains(cs.created_at) {
                        return Ok(Some(cs));
                    }
                }
                None => {
                    // Header was rejected; still consume the body so the
                    // stream stays positioned on the next sibling.
                    self.skip_subtree(b"changeset")?;
                }
            }
        }
    }

    fn skip_subtree(&mut self, name: &[u8]) -> Result<(), ParseError> {
        let mut sink = Vec::new();
        self.reader.read_to_end_into(QName(name), &mut sink)?;
        Ok(())
    }

    /// Consume tag and discussion children up to `</changeset>`.
    fn read_body(&mut self, cs: &mut Changeset) -> Result<(), ParseError> {
        loop {
            self.body_buf.clear();
            let skip = match self.reader.read_event_into(&mut self.body_buf)? {
                Event::Empty(e) if e.name().as_ref() == b"tag" => {
                    apply_tag(&e, &mut cs.tags);
                    continue;
                }
                Event::Start(e) if e.name().as_ref() == b"tag" => {
                    apply_tag(&e, &mut cs.tags);
                    b"tag".to_vec()
                }
                Event::Start(e) if e.name().as_ref() == b"discussion" => {
                    drop(e);
                    self.read_discussion(cs)?;
                    continue;
                }
                // Unknown child; skip the whole subtree.
                Event::Start(e) => e.name().as_ref().to_vec(),
                Event::End(e) if e.name().as_ref() == b"changeset" => return Ok(()),
                Event::Eof => return Err(ParseError::UnexpectedEof),
                _ => continue,
            };
            self.skip_subtree(&skip)?;
        }
    }

    fn read_discussion(&mut self, cs: &mut Changeset) -> Result<(), ParseError> {
        loop {
            self.body_buf.clear();
            let pending = match self.reader.read_event_into(&mut self.body_buf)? {
                Event::Start(e) if e.name().as_ref() == b"comment" => {
                    Some(parse_comment_attrs(&e))
                }
                Event::Empty(e) if e.name().as_ref() == b"comment" => {
                    cs.comments.push(parse_comment_attrs(&e));
                    continue;
                }
                Event::Start(e) => {
                    let name = e.name().as_ref().to_vec();
                    drop(e);
                    self.skip_subtree(&name)?;
                    continue;
                }
                Event::End(e) if e.name().as_ref() == b"discussion" => return Ok(()),
                Event::Eof => return Err(ParseError::UnexpectedEof),
                _ => continue,
            };
            if let Some(mut comment) = pending {
                self.read_comment_body(&mut comment)?;
                cs.comments.push(comment);
            }
        }
    }

    fn read_comment_body(&mut self, comment: &mut ChangesetComment) -> Result<(), ParseError> {
        let mut in_text = false;
        loop {
            self.body_buf.clear();
            let skip = match self.reader.read_event_into(&mut self.body_buf)? {
                Event::Start(e) if e.name().as_ref() == b"text" => {
                    in_text = true;
                    continue;
                }
                Event::End(e) if e.name().as_ref() == b"text" => {
                    in_text = false;
                    continue;
                }
                Event::Text(t) if in_text => {
                    comment.text.push_str(&t.unescape()?);
                    continue;
                }
                Event::Start(e) => e.name().as_ref().to_vec(),
                Event::End(e) if e.name().as_ref() == b"comment" => return Ok(()),
                Event::Eof => return Err(ParseError::UnexpectedEof),
                _ => continue,
            };
            self.skip_subtree(&skip)?;
        }
    }
}

impl<R: BufRead> Iterator for ChangesetReader<R> {
    type Item = Result<Changeset, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(cs)) => Some(Ok(cs)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Parse the `<changeset>` attributes. Returns None (and logs) when the
/// element must be skipped: missing/non-positive id, unparseable created_at,
/// or a coordinate outside its valid range.
fn parse_header(e: &BytesStart) -> Option<Changeset> {
    let mut id: Option<i64> = None;
    let mut username: Option<String> = None;
    let mut uid: i64 = 0;
    let mut created_at_raw: Option<String> = None;
    let mut closed_at: Option<DateTime<Utc>> = None;
    let mut open = false;
    let mut num_changes: i32 = 0;
    let mut comments_count: i32 = 0;
    let mut min_lon: Option<f64> = None;
    let mut min_lat: Option<f64> = None;
    let mut max_lon: Option<f64> = None;
    let mut max_lat: Option<f64> = None;
    let mut coords_malformed = false;

    for attr in e.attributes() {
        let attr = match attr {
            Ok(a) => a,
            Err(err) => {
                tracing::warn!(error = %err, "skipping changeset with malformed attributes");
                return None;
            }
        };
        let value = match attr.unescape_value() {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "skipping changeset with undecodable attribute");
                return None;
            }
        };

        match attr.key.as_ref() {
            b"id" => id = value.as_ref().parse().ok(),
            b"user" => username = Some(value.into_owned()),
            b"uid" => uid = value.as_ref().parse().unwrap_or(0),
            b"created_at" => created_at_raw = Some(value.into_owned()),
            b"closed_at" => {
                closed_at = parse_datetime(value.as_ref());
                if closed_at.is_none() {
                    tracing::warn!(raw = %value, "unparseable closed_at; treating as open-ended");
                }
            }
            b"open" => open = value.as_ref() == "true",
            b"num_changes" => num_changes = value.as_ref().parse().unwrap_or(0),
            b"comments_count" => comments_count = value.as_ref().parse().unwrap_or(0),
            b"min_lon" => match value.as_ref().parse() {
                Ok(v) => min_lon = Some(v),
                Err(_) => coords_malformed = true,
            },
            b"min_lat" => match value.as_ref().parse() {
                Ok(v) => min_lat = Some(v),
                Err(_) => coords_malformed = true,
            },
            b"max_lon" => match value.as_ref().parse() {
                Ok(v) => max_lon = Some(v),
                Err(_) => coords_malformed = true,
            },
            b"max_lat" => match value.as_ref().parse() {
                Ok(v) => max_lat = Some(v),
                Err(_) => coords_malformed = true,
            },
            _ => {}
        }
    }

    let id = match id {
        Some(v) if v > 0 => v,
        other => {
            tracing::warn!(id = ?other, "skipping changeset with missing or non-positive id");
            return None;
        }
    };

    let created_at = match created_at_raw.as_deref().and_then(parse_datetime) {
        Some(t) => t,
        None => {
            tracing::warn!(
                changeset_id = id,
                raw = created_at_raw.as_deref().unwrap_or(""),
                "skipping changeset with unparseable created_at"
            );
            return None;
        }
    };

    if coords_malformed {
        tracing::warn!(changeset_id = id, "skipping changeset with malformed coordinates");
        return None;
    }

    let bbox = match (min_lon, min_lat, max_lon, max_lat) {
        (Some(min_lon), Some(min_lat), Some(max_lon), Some(max_lat)) => {
            let b = BoundingBox {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            };
            if !b.is_valid() {
                tracing::warn!(changeset_id = id, "skipping changeset with out-of-range coordinates");
                return None;
            }
            Some(b)
        }
        (None, None, None, None) => None,
        _ => {
            // A partial box carries no usable extent.
            tracing::warn!(changeset_id = id, "incomplete bounding box; storing without geometry");
            None
        }
    };

    Some(Changeset {
        id,
        username,
        uid,
        created_at,
        closed_at,
        open,
        num_changes,
        comments_count,
        bbox,
        tags: BTreeMap::new(),
        comments: Vec::new(),
    })
}

fn apply_tag(e: &BytesStart, tags: &mut BTreeMap<String, String>) {
    let mut key: Option<String> = None;
    let mut value: Option<String> = None;

    for attr in e.attributes() {
        let Ok(attr) = attr else {
            tracing::warn!("skipping malformed tag attribute");
            return;
        };
        let Ok(v) = attr.unescape_value() else {
            tracing::warn!("skipping undecodable tag value");
            return;
        };
        match attr.key.as_ref() {
            b"k" => key = Some(v.into_owned()),
            b"v" => value = Some(v.into_owned()),
            _ => {}
        }
    }

    if let (Some(k), Some(v)) = (key, value) {
        // Duplicate keys: last value wins.
        tags.insert(k, v);
    }
}

fn parse_comment_attrs(e: &BytesStart) -> ChangesetComment {
    let mut comment = ChangesetComment {
        uid: 0,
        username: String::new(),
        date: None,
        text: String::new(),
    };

    for attr in e.attributes().flatten() {
        let Ok(value) = attr.unescape_value() else {
            continue;
        };
        match attr.key.as_ref() {
            b"uid" => comment.uid = value.as_ref().parse().unwrap_or(0),
            b"user" => comment.username = value.into_owned(),
            b"date" => comment.date = parse_datetime(value.as_ref()),
            _ => {}
        }
    }

    comment
}

/// ISO 8601 with a trailing `Z` treated as UTC.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(xml: &str) -> Vec<Changeset> {
        ChangesetReader::new(xml.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn parses_changeset_with_tags_and_discussion() {
        let xml = r#"<osm>
          <changeset id="42" created_at="2024-06-01T10:00:00Z" closed_at="2024-06-01T12:00:00Z"
                     open="false" user="alice" uid="7" num_changes="12" comments_count="1"
                     min_lon="4.8" min_lat="52.3" max_lon="4.9" max_lat="52.4">
            <tag k="comment" v="survey"/>
            <tag k="created_by" v="JOSM"/>
            <discussion>
              <comment uid="9" user="bob" date="2024-06-01T13:00:00Z">
                <text>nice work</text>
              </comment>
            </discussion>
          </changeset>
        </osm>"#;

        let got = parse_all(xml);
        assert_eq!(got.len(), 1);
        let cs = &got[0];
        assert_eq!(cs.id, 42);
        assert_eq!(cs.username.as_deref(), Some("alice"));
        assert_eq!(cs.uid, 7);
        assert!(!cs.open);
        assert_eq!(cs.num_changes, 12);
        assert_eq!(cs.comments_count, 1);
        assert_eq!(cs.tags.get("comment").unwrap(), "survey");
        assert_eq!(cs.tags.get("created_by").unwrap(), "JOSM");
        assert_eq!(cs.comments.len(), 1);
        assert_eq!(cs.comments[0].uid, 9);
        assert_eq!(cs.comments[0].username, "bob");
        assert_eq!(cs.comments[0].text, "nice work");
        assert!(cs.comments[0].date.is_some());
        let bbox = cs.bbox.unwrap();
        assert_eq!(bbox.min_lon, 4.8);
        assert_eq!(bbox.max_lat, 52.4);
    }

    #[test]
    fn document_order_is_preserved() {
        let xml = r#"<osm>
          <changeset id="1" created_at="2024-01-01T00:00:00Z" open="true"/>
          <changeset id="2" created_at="2024-01-02T00:00:00Z" open="true"/>
          <changeset id="3" created_at="2024-01-03T00:00:00Z" open="true"/>
        </osm>"#;
        let ids: Vec<i64> = parse_all(xml).iter().map(|cs| cs.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn anonymous_changeset_is_retained() {
        let xml = r#"<osm><changeset id="5" created_at="2024-01-01T00:00:00Z" open="true"/></osm>"#;
        let got = parse_all(xml);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].username, None);
        assert!(got[0].open);
        assert_eq!(got[0].closed_at, None);
    }

    #[test]
    fn skips_missing_or_non_positive_id() {
        let xml = r#"<osm>
          <changeset created_at="2024-01-01T00:00:00Z"/>
          <changeset id="0" created_at="2024-01-01T00:00:00Z"/>
          <changeset id="-3" created_at="2024-01-01T00:00:00Z"/>
          <changeset id="8" created_at="2024-01-01T00:00:00Z"/>
        </osm>"#;
        let got = parse_all(xml);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, 8);
    }

    #[test]
    fn skips_out_of_range_coordinates() {
        let xml = r#"<osm>
          <changeset id="1" created_at="2024-01-01T00:00:00Z"
                     min_lon="-181.0" min_lat="0" max_lon="0" max_lat="0"/>
          <changeset id="2" created_at="2024-01-01T00:00:00Z"
                     min_lon="0" min_lat="0" max_lon="0" max_lat="90.01"/>
        </osm>"#;
        assert!(parse_all(xml).is_empty());
    }

    #[test]
    fn skips_unparseable_created_at() {
        let xml = r#"<osm>
          <changeset id="1" created_at="yesterday"/>
          <changeset id="2" created_at="2024-01-01T00:00:00Z"/>
        </osm>"#;
        let got = parse_all(xml);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, 2);
    }

    #[test]
    fn rejected_header_does_not_desync_the_stream() {
        // The invalid element has children; they must be consumed so the
        // following sibling still parses.
        let xml = r#"<osm>
          <changeset id="0" created_at="2024-01-01T00:00:00Z">
            <tag k="a" v="b"/>
          </changeset>
          <changeset id="4" created_at="2024-01-01T00:00:00Z" open="true"/>
        </osm>"#;
        let got = parse_all(xml);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, 4);
    }

    #[test]
    fn missing_bbox_attributes_yield_no_geometry() {
        let xml = r#"<osm><changeset id="9" created_at="2024-01-01T00:00:00Z" open="true"/></osm>"#;
        assert_eq!(parse_all(xml)[0].bbox, None);
    }

    #[test]
    fn duplicate_tag_keys_take_last_value() {
        let xml = r#"<osm>
          <changeset id="9" created_at="2024-01-01T00:00:00Z">
            <tag k="source" v="first"/>
            <tag k="source" v="second"/>
          </changeset>
        </osm>"#;
        let got = parse_all(xml);
        assert_eq!(got[0].tags.get("source").unwrap(), "second");
    }

    #[test]
    fn unknown_children_are_skipped() {
        let xml = r#"<osm>
          <changeset id="9" created_at="2024-01-01T00:00:00Z">
            <mystery><inner>stuff</inner></mystery>
            <tag k="k" v="v"/>
          </changeset>
        </osm>"#;
        let got = parse_all(xml);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].tags.len(), 1);
    }

    #[test]
    fn comments_count_falls_back_to_parsed_comments() {
        let xml = r#"<osm>
          <changeset id="9" created_at="2024-01-01T00:00:00Z">
            <discussion>
              <comment uid="1" user="a" date="2024-01-01T00:00:00Z"><text>x</text></comment>
              <comment uid="2" user="b" date="2024-01-02T00:00:00Z"><text>y</text></comment>
            </discussion>
          </changeset>
        </osm>"#;
        let got = parse_all(xml);
        assert_eq!(got[0].comments_count, 2);
        assert_eq!(got[0].comments[1].username, "b");
    }

    #[test]
    fn date_window_filters_on_created_at() {
        let xml = r#"<osm>
          <changeset id="1" created_at="2024-01-01T00:00:00Z" open="true"/>
          <changeset id="2" created_at="2024-06-01T00:00:00Z" open="true"/>
          <changeset id="3" created_at="2024-12-01T00:00:00Z" open="true"/>
        </osm>"#;
        let window = DateWindow {
            from: parse_datetime("2024-03-01T00:00:00Z"),
            to: parse_datetime("2024-09-01T00:00:00Z"),
        };
        let got: Vec<Changeset> = ChangesetReader::with_window(xml.as_bytes(), window)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, 2);
    }

    #[test]
    fn empty_document_yields_nothing() {
        assert!(parse_all("<osm></osm>").is_empty());
    }

    #[test]
    fn truncated_document_is_a_fatal_error() {
        let xml = r#"<osm><changeset id="9" created_at="2024-01-01T00:00:00Z"><tag k="a" v="b"/>"#;
        let results: Vec<_> = ChangesetReader::new(xml.as_bytes()).collect();
        assert!(results.last().unwrap().is_err());
    }

    #[test]
    fn trailing_z_parses_as_utc() {
        let t = parse_datetime("2024-06-01T12:00:00Z").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-06-01T12:00:00+00:00");
        assert!(parse_datetime("2024-06-01T12:00:00+02:00").is_some());
        assert!(parse_datetime("not a date").is_none());
    }
}
