//! Prompt templates and tolerant reply parsers.
//!
//! Every LLM exchange in the engine goes through a template here, and every
//! reply is parsed by a sibling function, so the wire contracts live in one
//! place:
//!
//! - importance scoring replies carry one `IMPORTANCE_SCORE: <float>` line;
//! - episode narration replies carry `Title:` and `Summary:` sections;
//! - thought replies carry `NAME:` / `DESCRIPTION:` / `IMPORTANCE:` lines.
//!
//! Parsers are tolerant: models pad, re-order, and editorialize, so each
//! parser scans for its markers and falls back sensibly instead of failing
//! the pipeline.

use crate::types::ContentType;

/// Maximum characters kept from a generated episode title.
pub const TITLE_MAX_CHARS: usize = 50;
/// Maximum words kept from a generated thought name.
pub const THOUGHT_NAME_MAX_WORDS: usize = 10;
/// Maximum words kept from a generated narrative.
pub const NARRATIVE_MAX_WORDS: usize = 300;

/// Render the importance-scoring prompt for one record.
#[must_use]
pub fn importance_prompt(content: &str, content_type: ContentType) -> String {
    let framing = match content_type {
        ContentType::UserChat => {
            "You are scoring how much a message from a user reveals about them: \
             their preferences, relationships, plans, history, or feelings."
        }
        ContentType::AiResponse => {
            "You are scoring how much of an assistant's reply is worth remembering \
             long-term about the conversation it belongs to."
        }
        ContentType::UploadedFileEvent => {
            "You are scoring the long-term significance of a file upload event \
             in a personal conversation."
        }
        ContentType::UploadedDocumentContent => {
            "You are scoring how much personal, long-term-relevant information \
             this uploaded document content carries."
        }
        ContentType::ImageAnalysis => {
            "You are scoring how much personally meaningful information this \
             image description carries."
        }
    };
    format!(
        "{framing}\n\n\
         CONTENT:\n{content}\n\n\
         Reply with exactly one line in the form:\n\
         IMPORTANCE_SCORE: <float between 0 and 1>"
    )
}

/// Extract a score in `[0, 1]` from an importance reply.
///
/// Prefers the `IMPORTANCE_SCORE:` marker; falls back to the first bare
/// float in the text. Out-of-range or absent numbers yield `None` and the
/// caller runs the heuristic.
#[must_use]
pub fn parse_importance_reply(reply: &str) -> Option<f64> {
    for line in reply.lines() {
        let trimmed = line.trim();
        if let Some(rest) = strip_marker(trimmed, "IMPORTANCE_SCORE:") {
            return parse_unit_float(rest);
        }
    }
    // No marker: accept a bare float anywhere in the reply.
    reply
        .split_whitespace()
        .find_map(|token| parse_unit_float(token.trim_matches(|c: char| !c.is_ascii_digit() && c != '.')))
}

/// Render the title + narrative prompt over cluster (or seed chunk) text.
#[must_use]
pub fn narrative_prompt(member_text: &str) -> String {
    format!(
        "The following passages belong to one coherent episode in a person's life \
         or conversations. Write a short title and a narrative summary.\n\n\
         PASSAGES:\n{member_text}\n\n\
         Reply in exactly this format:\n\
         Title: <a title of at most 50 characters>\n\n\
         Summary: <a narrative of 150-300 words>"
    )
}

/// Parse a `Title:` / `Summary:` reply into `(title, narrative)`.
///
/// Falls back to the first non-empty line as the title and the remainder as
/// the narrative. The title is clamped to [`TITLE_MAX_CHARS`], the
/// narrative to [`NARRATIVE_MAX_WORDS`].
#[must_use]
pub fn parse_narrative_reply(reply: &str) -> Option<(String, String)> {
    let mut title: Option<String> = None;
    let mut summary_lines: Vec<&str> = Vec::new();
    let mut in_summary = false;

    for line in reply.lines() {
        let trimmed = line.trim();
        if let Some(rest) = strip_marker(trimmed, "Title:") {
            title = Some(rest.trim().to_string());
            in_summary = false;
            continue;
        }
        if let Some(rest) = strip_marker(trimmed, "Summary:") {
            in_summary = true;
            if !rest.trim().is_empty() {
                summary_lines.push(rest.trim());
            }
            continue;
        }
        if in_summary && !trimmed.is_empty() {
            summary_lines.push(trimmed);
        }
    }

    let narrative = summary_lines.join(" ");
    match (title, narrative.is_empty()) {
        (Some(title), false) if !title.is_empty() => {
            Some((clamp_chars(&title, TITLE_MAX_CHARS), clamp_words(&narrative, NARRATIVE_MAX_WORDS)))
        }
        _ => {
            // Free-form reply: first line is the title, the rest narrates.
            let mut lines = reply.lines().map(str::trim).filter(|l| !l.is_empty());
            let title = lines.next()?.to_string();
            let rest: Vec<&str> = lines.collect();
            if rest.is_empty() {
                return None;
            }
            Some((
                clamp_chars(&title, TITLE_MAX_CHARS),
                clamp_words(&rest.join(" "), NARRATIVE_MAX_WORDS),
            ))
        }
    }
}

/// Render the cross-episode insight prompt.
#[must_use]
pub fn thought_prompt(episode_summaries: &str) -> String {
    format!(
        "Below are titles and summaries of related episodes from one person's \
         memory. Derive a single higher-order insight that spans them.\n\n\
         EPISODES:\n{episode_summaries}\n\n\
         Reply in exactly this format (three lines):\n\
         NAME: <insight name, at most 10 words>\n\
         DESCRIPTION: <150-200 words describing the insight>\n\
         IMPORTANCE: <float between 0 and 1>"
    )
}

/// Parsed thought reply.
#[derive(Clone, Debug, PartialEq)]
pub struct ThoughtReply {
    pub name: String,
    pub description: String,
    /// Defaults to 0.5 when the reply's importance is absent or invalid.
    pub importance: f64,
}

/// Parse a `NAME:` / `DESCRIPTION:` / `IMPORTANCE:` reply.
///
/// Name and description are required (else `None`); a missing or invalid
/// importance defaults to 0.5 rather than discarding the insight.
#[must_use]
pub fn parse_thought_reply(reply: &str) -> Option<ThoughtReply> {
    let mut name: Option<String> = None;
    let mut description_lines: Vec<&str> = Vec::new();
    let mut importance: Option<f64> = None;
    let mut in_description = false;

    for line in reply.lines() {
        let trimmed = line.trim();
        if let Some(rest) = strip_marker(trimmed, "NAME:") {
            name = Some(rest.trim().to_string());
            in_description = false;
            continue;
        }
        if let Some(rest) = strip_marker(trimmed, "DESCRIPTION:") {
            in_description = true;
            if !rest.trim().is_empty() {
                description_lines.push(rest.trim());
            }
            continue;
        }
        if let Some(rest) = strip_marker(trimmed, "IMPORTANCE:") {
            importance = parse_unit_float(rest);
            in_description = false;
            continue;
        }
        if in_description && !trimmed.is_empty() {
            description_lines.push(trimmed);
        }
    }

    let name = name.filter(|n| !n.is_empty())?;
    let description = description_lines.join(" ");
    if description.is_empty() {
        return None;
    }
    Some(ThoughtReply {
        name: clamp_words(&name, THOUGHT_NAME_MAX_WORDS),
        description,
        importance: importance.unwrap_or(0.5),
    })
}

/// Format retrieved memories into the verbatim context block handed to the
/// chat provider ahead of the user's message.
#[must_use]
pub fn memory_context_block(lines: &[String]) -> String {
    let mut block = String::from(
        "RELEVANT MEMORIES (from earlier conversations; use them naturally, \
         do not recite them):\n",
    );
    for line in lines {
        block.push_str("- ");
        block.push_str(line);
        block.push('\n');
    }
    block
}

fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let head = line.get(..marker.len())?;
    head.eq_ignore_ascii_case(marker).then(|| &line[marker.len()..])
}

fn parse_unit_float(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().trim_end_matches(['.', ',']).parse().ok()?;
    (0.0..=1.0).contains(&value).then_some(value)
}

fn clamp_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn clamp_words(text: &str, max: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max {
        return words.join(" ");
    }
    words[..max].join(" ")
}
