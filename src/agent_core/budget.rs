//! Context budgeter: fits conversation history into the model's window.
//!
//! [`trim`] is a pure function. It evicts the oldest removable messages first
//! and, only when eviction alone cannot make the history fit, truncates the
//! largest remaining messages at a char boundary.
//!
//! Eviction works on units rather than single messages so the history stays
//! coherent:
//! - a tool call (assistant message naming a tool) and its tool result are
//!   one unit and leave together;
//! - system messages, the unit holding the most recent user message, and a
//!   trailing tool result are never evicted.

use serde::Serialize;

use super::tokens::{
    chars_per_token, estimate_content_tokens, estimate_message_tokens, fixed_message_tokens,
    truncate_utf8,
};
use super::types::{Message, Role};
use crate::config::{BudgetConfig, ModelConfig};

/// Appended to content the budgeter shortened.
pub const TRUNCATION_MARKER: &str = "\n[... truncated to fit the context window]";

// ─── ContextBudget ───────────────────────────────────────────────────────────

/// Window size and the reservations carved out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextBudget {
    pub context_window: u32,
    pub output_reservation: u32,
    pub safety_buffer: u32,
}

impl ContextBudget {
    pub fn from_config(model: &ModelConfig, budget: &BudgetConfig) -> Self {
        Self {
            context_window: model.context_window,
            output_reservation: budget.output_reservation,
            safety_buffer: budget.safety_buffer,
        }
    }

    /// Tokens to reserve when the non-history part of the prompt costs
    /// `fixed_tokens`.
    pub fn reserve(&self, fixed_tokens: u32) -> u32 {
        fixed_tokens
            .saturating_add(self.output_reservation)
            .saturating_add(self.safety_buffer)
    }

    pub fn limit(&self) -> u32 {
        self.context_window
    }
}

// ─── Trim ────────────────────────────────────────────────────────────────────

/// A contiguous run of messages evicted as a whole.
#[derive(Debug)]
struct Unit {
    start: usize,
    end: usize,
    protected: bool,
}

fn units(history: &[Message]) -> Vec<Unit> {
    let last_user = history.iter().rposition(|m| m.role == Role::User);
    let mut units = Vec::new();
    let mut i = 0;

    while i < history.len() {
        let msg = &history[i];
        let paired = msg.is_tool_call()
            && history
                .get(i + 1)
                .is_some_and(|next| next.role == Role::Tool);
        let end = if paired { i + 2 } else { i + 1 };
        let protected =
            msg.role == Role::System || last_user.is_some_and(|u| u >= i && u < end);
        units.push(Unit {
            start: i,
            end,
            protected,
        });
        i = end;
    }

    // A trailing tool result is pending: the next decision needs it.
    if let Some(last) = units.last_mut() {
        if history[last.start..last.end]
            .iter()
            .any(|m| m.role == Role::Tool)
        {
            last.protected = true;
        }
    }

    units
}

/// Fit `history` plus `reserve` tokens within `limit`.
///
/// Idempotent: trimming an already-trimmed history under the same
/// `reserve`/`limit` returns it unchanged.
pub fn trim(history: &[Message], reserve: u32, limit: u32) -> Vec<Message> {
    let costs: Vec<u32> = history.iter().map(estimate_message_tokens).collect();
    let total: u32 = costs.iter().sum();
    if total.saturating_add(reserve) <= limit {
        return history.to_vec();
    }

    let units = units(history);
    let mut keep = vec![true; units.len()];
    let mut running = total;

    for (idx, unit) in units.iter().enumerate() {
        if running.saturating_add(reserve) <= limit {
            break;
        }
        if unit.protected {
            continue;
        }
        keep[idx] = false;
        running -= costs[unit.start..unit.end].iter().sum::<u32>();
    }

    let mut kept: Vec<Message> = units
        .iter()
        .zip(&keep)
        .filter(|(_, keep)| **keep)
        .flat_map(|(unit, _)| history[unit.start..unit.end].iter().cloned())
        .collect();

    let evicted = history.len() - kept.len();
    let mut truncated = 0;
    if running.saturating_add(reserve) > limit {
        truncated = shrink_to_fit(&mut kept, limit.saturating_sub(reserve));
    }

    tracing::debug!(
        before_tokens = total,
        reserve,
        limit,
        evicted,
        truncated,
        remaining = kept.len(),
        "history trimmed"
    );

    kept
}

/// Truncate the largest messages until the total fits `available`.
///
/// Finds the highest per-message cap such that the capped total fits, then
/// cuts every message above the cap down to it. Returns the number of
/// messages truncated.
fn shrink_to_fit(messages: &mut [Message], available: u32) -> usize {
    let costs: Vec<u32> = messages.iter().map(estimate_message_tokens).collect();
    let floors: Vec<u32> = messages
        .iter()
        .map(|m| fixed_message_tokens(m) + estimate_content_tokens(m.role, TRUNCATION_MARKER))
        .collect();

    let capped_total = |cap: u32| -> u32 {
        costs
            .iter()
            .zip(&floors)
            .map(|(&cost, &floor)| cost.min(cap.max(floor)))
            .sum()
    };

    let cap = if capped_total(0) > available {
        0
    } else {
        let (mut lo, mut hi) = (0u32, costs.iter().copied().max().unwrap_or(0));
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if capped_total(mid) <= available {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo
    };

    let mut count = 0;
    for ((msg, &cost), &floor) in messages.iter_mut().zip(&costs).zip(&floors) {
        let target = cap.max(floor);
        if cost > target {
            truncate_message(msg, target);
            count += 1;
        }
    }
    count
}

/// Shorten `msg` so its estimated cost is at most `target` tokens.
fn truncate_message(msg: &mut Message, target: u32) {
    let content_tokens = target.saturating_sub(fixed_message_tokens(msg));
    let max_bytes = (f64::from(content_tokens) * chars_per_token(msg.role)).floor() as usize;
    let kept = truncate_utf8(&msg.content, max_bytes.saturating_sub(TRUNCATION_MARKER.len()));
    msg.content = format!("{kept}{TRUNCATION_MARKER}");
    msg.truncated = true;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
