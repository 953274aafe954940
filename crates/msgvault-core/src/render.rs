//! Rendering of redelivered messages: headers, quotes, bodies, captions.
//!
//! Output is HTML for the destination's HTML parse mode. Header parts are
//! joined with " - "; body texts of a merged unit are separated by blank
//! lines. The header always comes from the unit's first member.

use chrono::{DateTime, Utc};

use crate::{config::HeaderOptions, domain::DeliveryUnit};

/// Destination caption length cap for media sends.
pub const CAPTION_LIMIT: usize = 1024;

/// Escape HTML special characters for the destination's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Header date: "2026 Jan 05, 14:30", shifted by the configured UTC offset.
/// No timezone indicator by design; the offset already localizes it.
pub fn format_date(sent_at: DateTime<Utc>, timezone_offset_hours: i32) -> String {
    let adjusted = sent_at + chrono::Duration::hours(timezone_offset_hours as i64);
    adjusted.format("%Y %b %d, %H:%M").to_string()
}

/// Truncate to `max_chars` characters, appending "..." when cut. Works on
/// char boundaries, so multibyte text can never be split mid-character.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Render the full HTML body for one delivery unit.
///
/// `resolved_reply` signals that the unit will be sent as a native reply;
/// in that case the header link fallback is skipped. When the reply target
/// is unknown in the destination (never exported, or not delivered yet) and
/// `show_reply_link` is on, a link into the source chat is rendered instead.
pub fn render_unit(unit: &DeliveryUnit, opts: &HeaderOptions, resolved_reply: bool) -> String {
    let Some(first) = unit.members.first() else {
        return String::new();
    };

    let mut parts: Vec<String> = Vec::new();

    let mut header: Vec<String> = Vec::new();
    if let Some(sender) = render_sender(unit, opts) {
        header.push(sender);
    }
    if opts.show_reply_link && !resolved_reply {
        if let Some(reply_to) = first.reply_to_id {
            let url = format!("https://t.me/c/{}/{}", first.chat_id.0, reply_to.0);
            if opts.hidden_reply_links {
                header.push(format!("<a href=\"{url}\">\u{21a9}\u{fe0f} Reply</a>"));
            } else {
                header.push(url);
            }
        }
    }
    if opts.show_date {
        if let Some(sent_at) = first.sent_at {
            header.push(format_date(sent_at, opts.timezone_offset_hours));
        }
    }
    if !header.is_empty() {
        parts.push(header.join(" - "));
    }

    if let Some(quote) = first.quote_text.as_deref().filter(|q| !q.trim().is_empty()) {
        parts.push(format!(
            "<pre>\u{275d} {} \u{275e}</pre>",
            escape_html(quote)
        ));
    }

    let body: Vec<String> = unit
        .members
        .iter()
        .filter_map(|m| m.text.as_deref())
        .filter(|t| !t.trim().is_empty())
        .map(escape_html)
        .collect();
    if !body.is_empty() {
        parts.push(body.join("\n\n"));
    }

    // A bare media message with all header options off would otherwise send
    // an empty body; fall back to the date so something identifies it.
    if parts.is_empty() {
        if let Some(sent_at) = first.sent_at {
            parts.push(format_date(sent_at, opts.timezone_offset_hours));
        }
    }

    parts.join("\n\n")
}

fn render_sender(unit: &DeliveryUnit, opts: &HeaderOptions) -> Option<String> {
    if !opts.show_sender_name && !opts.show_sender_username {
        return None;
    }
    let sender = &unit.members.first()?.sender;

    let name = sender.name.as_deref().filter(|_| opts.show_sender_name);
    let username = sender
        .username
        .as_deref()
        .filter(|_| opts.show_sender_username);

    let raw = match (name, username) {
        (Some(n), Some(u)) => format!("{n} (@{u})"),
        (Some(n), None) => n.to_string(),
        (None, Some(u)) => format!("@{u}"),
        (None, None) => return None,
    };
    Some(escape_html(&raw))
}
