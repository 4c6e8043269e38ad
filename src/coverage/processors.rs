//! Top-level processors of a pipeline source, with the lines they span.

use crate::error::{Error, Result};
use serde_json::Value;
use yaml_rust2::parser::{Event, MarkedEventReceiver, Parser};
use yaml_rust2::scanner::Marker;

/// One entry of a pipeline's `processors` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processor {
    /// Processor name, the single key of the entry.
    pub processor_type: String,
    pub tag: Option<String>,
    pub description: Option<String>,
    /// 1-based, inclusive.
    pub first_line: usize,
    pub last_line: usize,
}

impl Processor {
    pub fn lines(&self) -> std::ops::RangeInclusive<usize> {
        self.first_line..=self.last_line
    }
}

fn parse_error(pipeline: &str, reason: impl Into<String>) -> Error {
    Error::PipelineParse {
        pipeline: pipeline.to_string(),
        reason: reason.into(),
    }
}

fn annotation(config: Option<&Value>, key: &str) -> Option<String> {
    config?.get(key)?.as_str().map(str::to_string)
}

#[derive(Default)]
struct EventCollector {
    events: Vec<(Event, Marker)>,
}

impl MarkedEventReceiver for EventCollector {
    fn on_event(&mut self, event: Event, mark: Marker) {
        self.events.push((event, mark));
    }
}

/// Index just past the node starting at `i`.
fn skip_node(events: &[(Event, Marker)], mut i: usize) -> usize {
    let mut depth = 0usize;
    while i < events.len() {
        match events[i].0 {
            Event::SequenceStart(..) | Event::MappingStart(..) => depth += 1,
            Event::SequenceEnd | Event::MappingEnd => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
        if depth == 0 {
            break;
        }
    }
    i
}

fn scalar(event: &Event) -> Option<&str> {
    match event {
        Event::Scalar(value, ..) => Some(value.as_str()),
        _ => None,
    }
}

struct YamlEntry {
    processor_type: String,
    line: usize,
    tag: Option<String>,
    description: Option<String>,
}

/// Processors of a YAML pipeline. Each one spans from its entry up to the
/// line before the next entry; the last one up to the line before the next
/// top-level key, or the end of the document.
pub fn processors_from_yaml(pipeline: &str, content: &str) -> Result<Vec<Processor>> {
    let mut collector = EventCollector::default();
    Parser::new_from_str(content)
        .load(&mut collector, false)
        .map_err(|e| parse_error(pipeline, e.to_string()))?;
    let events = collector.events;

    let Some(root) = events
        .iter()
        .position(|(e, _)| !matches!(e, Event::StreamStart | Event::DocumentStart))
    else {
        return Ok(Vec::new());
    };
    match events[root].0 {
        Event::MappingStart(..) => {}
        Event::StreamEnd | Event::DocumentEnd => return Ok(Vec::new()),
        _ => return Err(parse_error(pipeline, "pipeline is not a mapping")),
    }

    let mut entries = Vec::new();
    let mut end_line = None;
    let mut seen_processors = false;
    let mut i = root + 1;
    while i < events.len() && !matches!(events[i].0, Event::MappingEnd) {
        let key_line = events[i].1.line();
        let key = scalar(&events[i].0).map(str::to_string);
        i = skip_node(&events, i);
        if seen_processors && end_line.is_none() {
            end_line = Some(key_line.saturating_sub(1));
        }
        if key.as_deref() == Some("processors") {
            entries = yaml_entries(pipeline, &events, i)?;
            seen_processors = true;
        }
        i = skip_node(&events, i);
    }

    let last = content.lines().count();
    let mut processors = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let next = match entries.get(idx + 1) {
            Some(next) => next.line.saturating_sub(1),
            None => end_line.unwrap_or(last),
        };
        processors.push(Processor {
            processor_type: entry.processor_type.clone(),
            tag: entry.tag.clone(),
            description: entry.description.clone(),
            first_line: entry.line,
            last_line: next.max(entry.line),
        });
    }
    Ok(processors)
}

fn yaml_entries(pipeline: &str, events: &[(Event, Marker)], start: usize) -> Result<Vec<YamlEntry>> {
    match events.get(start).map(|(e, _)| e) {
        Some(Event::SequenceStart(..)) => {}
        Some(Event::Scalar(value, ..)) if value.is_empty() || value == "~" || value == "null" => {
            return Ok(Vec::new())
        }
        _ => return Err(parse_error(pipeline, "processors is not a list")),
    }

    let mut entries = Vec::new();
    let mut i = start + 1;
    while i < events.len() && !matches!(events[i].0, Event::SequenceEnd) {
        let idx = entries.len();
        let line = events[i].1.line();
        if !matches!(events[i].0, Event::MappingStart(..)) {
            return Err(parse_error(pipeline, format!("processor#{} is not a single-key map", idx)));
        }
        let end = skip_node(events, i);

        let mut j = i + 1;
        let mut keys = Vec::new();
        let mut config_start = None;
        while j < end - 1 {
            keys.push(scalar(&events[j].0).map(str::to_string));
            j = skip_node(events, j);
            config_start.get_or_insert(j);
            j = skip_node(events, j);
        }
        let [Some(processor_type)] = keys.as_slice() else {
            return Err(parse_error(
                pipeline,
                format!("processor#{} is not a single-key map ({} keys)", idx, keys.len()),
            ));
        };
        let (tag, description) = config_start
            .map(|c| yaml_annotations(events, c))
            .unwrap_or_default();

        entries.push(YamlEntry {
            processor_type: processor_type.clone(),
            line,
            tag,
            description,
        });
        i = end;
    }
    Ok(entries)
}

/// `tag` and `description` scalars directly under a processor config.
fn yaml_annotations(events: &[(Event, Marker)], start: usize) -> (Option<String>, Option<String>) {
    let mut tag = None;
    let mut description = None;
    if !matches!(events[start].0, Event::MappingStart(..)) {
        return (tag, description);
    }
    let end = skip_node(events, start);
    let mut i = start + 1;
    while i < end - 1 {
        let key = scalar(&events[i].0);
        let value_at = skip_node(events, i);
        let value = events.get(value_at).and_then(|(e, _)| scalar(e)).map(str::to_string);
        match key {
            Some("tag") => tag = value,
            Some("description") => description = value,
            _ => {}
        }
        i = skip_node(events, value_at);
    }
    (tag, description)
}

enum Frame {
    Object { key: Option<String>, awaiting_key: bool },
    Array,
}

/// Byte offsets of the first key and the closing brace of every object at
/// the path `{ "processors" [ {`.
fn processor_offsets(content: &[u8]) -> Result<Vec<(usize, usize)>> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut offsets = Vec::new();
    let mut open_start = None;
    let mut i = 0;

    let at_processor = |stack: &[Frame]| {
        matches!(
            stack,
            [Frame::Object { key: Some(key), .. }, Frame::Array, Frame::Object { .. }] if key == "processors"
        )
    };

    while i < content.len() {
        match content[i] {
            b'{' => {
                stack.push(Frame::Object {
                    key: None,
                    awaiting_key: true,
                });
                i += 1;
            }
            b'[' => {
                stack.push(Frame::Array);
                i += 1;
            }
            b'}' => {
                if at_processor(&stack) {
                    let start = open_start
                        .take()
                        .ok_or_else(|| Error::Config("processor entry without a key".to_string()))?;
                    offsets.push((start, i));
                }
                stack.pop();
                i += 1;
            }
            b']' => {
                stack.pop();
                i += 1;
            }
            b',' => {
                if let Some(Frame::Object { awaiting_key, .. }) = stack.last_mut() {
                    *awaiting_key = true;
                }
                i += 1;
            }
            b'"' => {
                let start = i;
                let end = string_end(content, i)?;
                let first_key = at_processor(&stack);
                if let Some(Frame::Object { key, awaiting_key }) = stack.last_mut() {
                    if *awaiting_key {
                        if first_key && key.is_none() {
                            open_start = Some(start);
                        }
                        *key = Some(String::from_utf8_lossy(&content[start + 1..end]).into_owned());
                        *awaiting_key = false;
                    }
                }
                i = end + 1;
            }
            _ => i += 1,
        }
    }
    Ok(offsets)
}

/// Offset of the quote closing the string opened at `start`.
fn string_end(content: &[u8], start: usize) -> Result<usize> {
    let mut i = start + 1;
    while i < content.len() {
        match content[i] {
            b'\\' => i += 2,
            b'"' => return Ok(i),
            _ => i += 1,
        }
    }
    Err(Error::Config(format!("unterminated string at offset {}", start)))
}

/// Converts byte offsets into 1-based line numbers. Offsets must be strictly
/// ascending and inside `content`.
pub fn offsets_to_line_numbers(offsets: &[usize], content: &[u8]) -> Result<Vec<usize>> {
    let mut lines = Vec::with_capacity(offsets.len());
    let mut line = 1;
    let mut pos = 0;
    let mut previous = None;
    for &offset in offsets {
        if offset >= content.len() {
            return Err(Error::Config(format!(
                "offset {} out of range (content has {} bytes)",
                offset,
                content.len()
            )));
        }
        if previous.is_some_and(|p| offset <= p) {
            return Err(Error::Config(format!(
                "offsets not in ascending order: {} after {}",
                offset,
                previous.unwrap_or_default()
            )));
        }
        line += content[pos..offset].iter().filter(|&&b| b == b'\n').count();
        pos = offset;
        previous = Some(offset);
        lines.push(line);
    }
    Ok(lines)
}

/// Processors of a JSON pipeline. Each one spans from the line of its key to
/// the line of its closing brace.
pub fn processors_from_json(pipeline: &str, content: &[u8]) -> Result<Vec<Processor>> {
    let document: Value = serde_json::from_slice(content).map_err(|e| parse_error(pipeline, e.to_string()))?;
    let entries = match document.get("processors") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err(parse_error(pipeline, "processors is not a list")),
    };

    let mut processors = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let single = entry.as_object().filter(|m| m.len() == 1);
        let Some((processor_type, config)) = single.and_then(|m| m.iter().next()) else {
            return Err(parse_error(pipeline, format!("processor#{} is not a single-key map", idx)));
        };
        processors.push(Processor {
            processor_type: processor_type.clone(),
            tag: annotation(Some(config), "tag"),
            description: annotation(Some(config), "description"),
            first_line: 0,
            last_line: 0,
        });
    }

    let offsets = processor_offsets(content).map_err(|e| parse_error(pipeline, e.to_string()))?;
    if offsets.len() != processors.len() {
        return Err(parse_error(
            pipeline,
            format!(
                "found {} processor entries but {} processors",
                offsets.len(),
                processors.len()
            ),
        ));
    }
    let flat: Vec<usize> = offsets.iter().flat_map(|&(start, end)| [start, end]).collect();
    let lines = offsets_to_line_numbers(&flat, content).map_err(|e| parse_error(pipeline, e.to_string()))?;
    for (processor, span) in processors.iter_mut().zip(lines.chunks(2)) {
        processor.first_line = span[0];
        processor.last_line = span[1];
    }
    Ok(processors)
}
