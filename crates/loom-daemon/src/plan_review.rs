use chrono::Utc;
use loom_core::store::{DocHandle, Origin};
use loom_core::{PlanComment, ReviewStatus, TaskDocument};
use serde_json::Value;
use similar::TextDiff;
use tracing::debug;

/// Converts the browser's edited plan document back to markdown.
pub trait PlanRenderer: Send + Sync {
    fn render(&self, content: &Value) -> Option<String>;
}

/// Accepts plain strings, `{ "markdown": ... }`, or a block tree of
/// `{ "type", "content": [...], "text" }` nodes.
#[derive(Debug, Default, Clone)]
pub struct DefaultPlanRenderer;

impl PlanRenderer for DefaultPlanRenderer {
    fn render(&self, content: &Value) -> Option<String> {
        match content {
            Value::String(text) => Some(text.clone()),
            Value::Object(map) => {
                if let Some(Value::String(markdown)) = map.get("markdown") {
                    return Some(markdown.clone());
                }
                let blocks = map.get("content")?.as_array()?;
                let lines = blocks.iter().map(render_block).collect::<Vec<_>>();
                Some(lines.join("\n"))
            }
            _ => None,
        }
    }
}

fn render_block(node: &Value) -> String {
    let text = inline_text(node);
    match node.get("type").and_then(Value::as_str) {
        Some("heading") => {
            let level = node
                .get("attrs")
                .and_then(|attrs| attrs.get("level"))
                .and_then(Value::as_u64)
                .unwrap_or(1)
                .clamp(1, 6) as usize;
            format!("{} {}", "#".repeat(level), text)
        }
        Some("bulletList") | Some("orderedList") => node
            .get("content")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| format!("- {}", inline_text(item)))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default(),
        _ => text,
    }
}

fn inline_text(node: &Value) -> String {
    if let Some(text) = node.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    node.get("content")
        .and_then(Value::as_array)
        .map(|children| children.iter().map(inline_text).collect::<String>())
        .unwrap_or_default()
}

/// Combines reviewer input into one feedback document. Returns `None` when
/// there is nothing to say.
pub fn build_feedback(
    original: &str,
    edited: Option<&str>,
    comments: &[&PlanComment],
    message: Option<&str>,
) -> Option<String> {
    let mut sections = Vec::new();

    if let Some(message) = message.map(str::trim).filter(|m| !m.is_empty()) {
        sections.push(format!("## General Feedback\n\n{message}"));
    }

    if !comments.is_empty() {
        let mut body = String::from("## Comments");
        for comment in comments {
            let excerpt = excerpt(original, comment.range.from, comment.range.to);
            body.push_str("\n\n");
            if !excerpt.trim().is_empty() {
                for line in excerpt.lines() {
                    body.push_str("> ");
                    body.push_str(line);
                    body.push('\n');
                }
            }
            body.push_str(comment.body.trim());
        }
        sections.push(body);
    }

    if let Some(edited) = edited.filter(|edited| edited.trim_end() != original.trim_end()) {
        let diff = TextDiff::from_lines(original, edited)
            .unified_diff()
            .context_radius(3)
            .header("plan (original)", "plan (edited)")
            .to_string();
        sections.push(format!("## Changes\n\n```diff\n{}```", ensure_newline(diff)));
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

fn excerpt(text: &str, from: usize, to: usize) -> String {
    if to <= from {
        return String::new();
    }
    text.chars().skip(from).take(to - from).collect()
}

fn ensure_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Records the review outcome on the plan created by `tool_use_id` and
/// returns the feedback that should replace the reviewer's raw message.
pub async fn resolve_plan_review(
    task: &DocHandle<TaskDocument>,
    tool_use_id: &str,
    approved: bool,
    message: Option<&str>,
    renderer: &dyn PlanRenderer,
) -> Option<String> {
    let snapshot = task.snapshot().await;
    let Some(plan) = snapshot.plan_by_tool_use(tool_use_id) else {
        debug!(event = "plan_review_missing_plan", task_id = %task.id(), tool_use_id = %tool_use_id);
        return None;
    };

    let edited = plan.content.as_ref().and_then(|content| renderer.render(content));
    let mut comments = snapshot
        .plan_comments
        .values()
        .filter(|comment| comment.plan_id == plan.plan_id && comment.resolved_at.is_none())
        .collect::<Vec<_>>();
    comments.sort_by_key(|comment| (comment.range.from, comment.range.to));

    let feedback = build_feedback(&plan.markdown, edited.as_deref(), &comments, message);
    let status = if approved {
        ReviewStatus::Approved
    } else {
        ReviewStatus::ChangesRequested
    };
    let plan_id = plan.plan_id.clone();
    let stored = feedback.clone();
    let reviewed_at = Utc::now().to_rfc3339();
    task.update(Origin::Local, move |doc| {
        if let Some(plan) = doc.plans.iter_mut().find(|plan| plan.plan_id == plan_id) {
            plan.review_status = status;
            plan.review_feedback = stored;
        }
        doc.meta.updated_at = Some(reviewed_at);
    })
    .await;
    feedback
}
