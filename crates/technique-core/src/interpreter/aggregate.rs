//! `quorum` and `consensus`: vote on a field across governed results.
//!
//! Votes are the values of `parameters.field` in the latest usable step of
//! each governed primitive, grouped by structural equality. Values nested
//! deeper than [`MAX_VOTE_DEPTH`] cannot be compared safely and escalate.

use serde_json::{Map, Value, json};
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter, latest_steps};

pub const MAX_VOTE_DEPTH: usize = 64;

pub struct QuorumInterpreter;
pub struct ConsensusInterpreter;

/// One group of equal votes.
struct Tally {
    value: Value,
    votes: usize,
}

/// Nesting depth of a value, stopping once `limit` is exceeded.
fn depth_exceeds(value: &Value, limit: usize) -> bool {
    let mut stack = vec![(value, 0usize)];
    while let Some((v, depth)) = stack.pop() {
        if depth > limit {
            return true;
        }
        match v {
            Value::Array(items) => stack.extend(items.iter().map(|i| (i, depth + 1))),
            Value::Object(map) => stack.extend(map.values().map(|i| (i, depth + 1))),
            _ => {}
        }
    }
    false
}

enum Ballot {
    Counted { tallies: Vec<Tally>, voters: usize },
    Unsafe(String),
}

fn collect(steps: &[ExecutionStep], ctx: &OperatorContext<'_>) -> Ballot {
    let field = ctx.operator.param_str("field").unwrap_or("result");
    let mut tallies: Vec<Tally> = Vec::new();
    let mut voters = 0;
    for step in latest_steps(steps, ctx.governed) {
        if !step.status.is_usable() {
            continue;
        }
        let Some(value) = step.output.get(field) else {
            continue;
        };
        if depth_exceeds(value, MAX_VOTE_DEPTH) {
            return Ballot::Unsafe(step.primitive_id.clone());
        }
        voters += 1;
        match tallies.iter_mut().find(|t| &t.value == value) {
            Some(t) => t.votes += 1,
            None => tallies.push(Tally {
                value: value.clone(),
                votes: 1,
            }),
        }
    }
    Ballot::Counted { tallies, voters }
}

/// Leading group; ties resolve to the earliest-seen value.
fn leader(tallies: &[Tally]) -> Option<&Tally> {
    tallies.iter().fold(None, |best: Option<&Tally>, t| match best {
        Some(b) if b.votes >= t.votes => Some(b),
        _ => Some(t),
    })
}

fn record(ctx: &mut OperatorContext<'_>, tallies: &[Tally]) {
    let votes: Vec<Value> = tallies
        .iter()
        .map(|t| json!({"value": t.value, "votes": t.votes}))
        .collect();
    ctx.private().insert("tally".to_string(), Value::Array(votes));
}

fn escalate(ctx: &OperatorContext<'_>, primitive_id: &str) -> Decision {
    Decision::Escalate {
        reason: format!(
            "'{}' cannot compare the vote from '{primitive_id}': nesting exceeds {MAX_VOTE_DEPTH} levels",
            ctx.operator.id
        ),
    }
}

impl OperatorInterpreter for QuorumInterpreter {
    fn after_execute(&self, steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let tallies = match collect(steps, ctx) {
            Ballot::Counted { tallies, .. } => tallies,
            Ballot::Unsafe(pid) => return escalate(ctx, &pid),
        };
        record(ctx, &tallies);

        let total = ctx.governed.len();
        let needed = total.div_ceil(2).max(1);
        match leader(&tallies) {
            Some(top) if top.votes >= needed => {
                let mut outputs = Map::new();
                outputs.insert("quorumReached".to_string(), Value::Bool(true));
                outputs.insert("value".to_string(), top.value.clone());
                outputs.insert("votes".to_string(), json!(top.votes));
                outputs.insert("total".to_string(), json!(total));
                Decision::with_outputs(outputs)
            }
            top => Decision::terminate(format!(
                "quorum '{}' not reached: {} of {needed} required votes",
                ctx.operator.id,
                top.map_or(0, |t| t.votes)
            )),
        }
    }
}

impl OperatorInterpreter for ConsensusInterpreter {
    fn after_execute(&self, steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let (tallies, voters) = match collect(steps, ctx) {
            Ballot::Counted { tallies, voters } => (tallies, voters),
            Ballot::Unsafe(pid) => return escalate(ctx, &pid),
        };
        record(ctx, &tallies);

        let total = ctx.governed.len();
        let unanimous = ctx.operator.param_str("mode") == Some("unanimous");
        let agreed = match leader(&tallies) {
            Some(top) if unanimous => (tallies.len() == 1 && voters == total).then_some(top),
            // Strict plurality: the leader must beat every other group.
            Some(top) => tallies
                .iter()
                .filter(|t| t.votes == top.votes)
                .count()
                .eq(&1)
                .then_some(top),
            None => None,
        };

        match agreed {
            Some(top) => {
                let mut outputs = Map::new();
                outputs.insert("consensusReached".to_string(), Value::Bool(true));
                outputs.insert("value".to_string(), top.value.clone());
                outputs.insert("votes".to_string(), json!(top.votes));
                outputs.insert("total".to_string(), json!(total));
                Decision::with_outputs(outputs)
            }
            None => Decision::terminate(format!(
                "consensus '{}' not reached among {voters} of {total} results",
                ctx.operator.id
            )),
        }
    }
}
