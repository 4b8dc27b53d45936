//! C6 — Autonomous Breakdowner: the default heuristic implementation of
//! the `Breakdowner` trait, splitting oversized tasks into category-specific
//! sub-task templates. Pluggable: callers may register a richer (e.g.
//! LLM-backed) implementation under a different name (§4.6, §9).

use async_trait::async_trait;

use crate::errors::Result;
use crate::runner::{Breakdowner, BreakdownPlan};
use crate::types::{Category, DependencyEdge, DependencyKind, Priority, Task};

/// Splits `feature`/`refactor` work into a four-step pipeline, and
/// `bug-fix`/`performance` work into a lighter two-step split. Other
/// categories are not broken down (the plan is "not beneficial").
pub struct DefaultBreakdowner;

#[async_trait]
impl Breakdowner for DefaultBreakdowner {
    async fn breakdown(&self, task: &Task) -> Result<BreakdownPlan> {
        let templates: Vec<&str> = match task.category {
            Category::Feature | Category::Refactor => {
                vec!["analysis", "design", "implementation", "verification"]
            }
            Category::BugFix | Category::Performance => vec!["diagnosis", "fix"],
            _ => return Ok(BreakdownPlan::not_beneficial()),
        };

        let per_step = task.estimated_duration / (templates.len() as i32);
        let mut sub_tasks = Vec::with_capacity(templates.len());
        for step in &templates {
            let sub_task = Task::new(format!("{}: {}", task.title, step), task.runner_name.clone())
                .with_priority(task.base_priority)
                .with_category(task.category)
                .with_complexity(crate::types::Complexity::Simple);
            let mut sub_task = sub_task;
            sub_task.estimated_duration = per_step;
            sub_task.parent_task_id = Some(task.id.clone());
            sub_tasks.push(sub_task);
        }

        let mut internal_edges = Vec::new();
        for window in sub_tasks.windows(2) {
            internal_edges.push(DependencyEdge::new(
                window[1].id.clone(),
                window[0].id.clone(),
                DependencyKind::Hard,
            ));
        }

        // Conservative speedup estimate: splitting into N sequential steps
        // of equal duration never beats the whole by more than a small
        // overlap margin unless steps can run in parallel; the default
        // template is sequential, so we report a modest 1.05x.
        let improvement_estimate = if matches!(task.base_priority, Priority::Critical | Priority::High) {
            1.1
        } else {
            1.05
        };

        Ok(BreakdownPlan {
            sub_tasks,
            internal_edges,
            improvement_estimate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Complexity;

    #[tokio::test]
    async fn feature_task_splits_into_four_steps() {
        let task = Task::new("ship widget", "default")
            .with_category(Category::Feature)
            .with_complexity(Complexity::Complex);
        let plan = DefaultBreakdowner.breakdown(&task).await.unwrap();
        assert_eq!(plan.sub_tasks.len(), 4);
        assert_eq!(plan.internal_edges.len(), 3);
        assert!(plan.is_beneficial());
    }

    #[tokio::test]
    async fn docs_task_is_not_broken_down() {
        let task = Task::new("write readme", "default").with_category(Category::Docs);
        let plan = DefaultBreakdowner.breakdown(&task).await.unwrap();
        assert!(!plan.is_beneficial());
    }

    #[tokio::test]
    async fn sub_task_durations_sum_to_parent_estimate() {
        let mut task = Task::new("fix bug", "default").with_category(Category::BugFix);
        task.estimated_duration = chrono::Duration::minutes(10);
        let plan = DefaultBreakdowner.breakdown(&task).await.unwrap();
        let total: chrono::Duration = plan
            .sub_tasks
            .iter()
            .fold(chrono::Duration::zero(), |acc, t| acc + t.estimated_duration);
        assert_eq!(total, task.estimated_duration);
    }
}
