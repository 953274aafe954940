//! Batching engine: merge consecutive short messages into delivery units.
//!
//! A single O(n) pass over the manifest order, no backtracking. Thresholds
//! are inclusive: when eligibility is decided by threshold equality the
//! engine prefers merging, which minimizes destination message count.

use crate::{
    config::BatchPolicy,
    domain::{DeliveryUnit, SourceMessage},
};

/// Rough allowance for the rendered header and separators when estimating the
/// combined unit length against the policy budget.
const HEADER_ESTIMATE: usize = 200;

/// Group an exported message sequence into delivery units.
///
/// The output is a partition of the input: concatenating all unit members in
/// order reproduces the input sequence exactly. A message merges into the
/// forming unit only when all of these hold:
/// - batching is enabled and the unit is not full,
/// - it carries no media and has non-empty text at or under the length cap,
/// - it has no reply reference, or the reply target is itself a member of the
///   forming unit,
/// - its sender matches the unit's first member,
/// - the gap to the previous message is at or under the time threshold,
/// - the combined text stays within the overall budget.
pub fn build_units(messages: &[SourceMessage], policy: &BatchPolicy) -> Vec<DeliveryUnit> {
    let mut units: Vec<DeliveryUnit> = Vec::new();
    let mut current: Vec<SourceMessage> = Vec::new();

    for msg in messages {
        if !policy.enabled || !mergeable_content(msg, policy) {
            flush(&mut units, &mut current);
            units.push(DeliveryUnit::solo(msg.clone()));
            continue;
        }

        let reply_satisfied = match msg.reply_to_id {
            None => true,
            Some(target) => current.iter().any(|m| m.id == target),
        };

        if current.is_empty() {
            if msg.reply_to_id.is_some() {
                // A reply can never start a merged unit: its target is not here.
                units.push(DeliveryUnit::solo(msg.clone()));
            } else {
                current.push(msg.clone());
            }
            continue;
        }

        if reply_satisfied && can_extend(&current, msg, policy) {
            current.push(msg.clone());
        } else {
            flush(&mut units, &mut current);
            if msg.reply_to_id.is_some() {
                units.push(DeliveryUnit::solo(msg.clone()));
            } else {
                current.push(msg.clone());
            }
        }
    }

    flush(&mut units, &mut current);
    units
}

fn mergeable_content(msg: &SourceMessage, policy: &BatchPolicy) -> bool {
    if msg.has_media() || !msg.has_text() {
        return false;
    }
    text_chars(msg) <= policy.max_message_len
}

fn can_extend(current: &[SourceMessage], msg: &SourceMessage, policy: &BatchPolicy) -> bool {
    if current.len() >= policy.max_messages {
        return false;
    }

    let first = &current[0];
    if msg.sender.id != first.sender.id {
        return false;
    }

    let last = &current[current.len() - 1];
    let within_gap = match (msg.sent_at, last.sent_at) {
        (Some(a), Some(b)) => {
            let gap = a.signed_duration_since(b);
            gap <= chrono::Duration::from_std(policy.time_gap).unwrap_or(chrono::Duration::MAX)
        }
        // An unknown timestamp gives no evidence of proximity.
        _ => false,
    };
    if !within_gap {
        return false;
    }

    let combined: usize = current.iter().map(text_chars).sum::<usize>()
        + text_chars(msg)
        + current.len() * 2
        + HEADER_ESTIMATE;
    combined <= policy.combined_budget
}

fn flush(units: &mut Vec<DeliveryUnit>, current: &mut Vec<SourceMessage>) {
    if current.is_empty() {
        return;
    }
    units.push(DeliveryUnit {
        members: std::mem::take(current),
        reply_target: None,
    });
}

fn text_chars(msg: &SourceMessage) -> usize {
    msg.text.as_deref().map_or(0, |t| t.chars().count())
}
