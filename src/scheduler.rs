//! C3 — Priority Scheduler: dynamic priority scoring and slot-bounded
//! selection under a configurable strategy/policy pair.

use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::config::{SchedulerSection, SchedulingStrategy, SelectionPolicy};
use crate::types::{Priority, Task, TaskId};

const MIN_SCORE: f64 = 1.0;
const MAX_SCORE: f64 = 2000.0;

#[derive(Debug, Clone)]
pub struct ScoredTask {
    pub task_id: TaskId,
    pub score: f64,
    pub category_key: String,
    pub resources: HashSet<String>,
    pub age_hours: f64,
}

impl PartialEq for ScoredTask {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.task_id == other.task_id
    }
}
impl Eq for ScoredTask {}
impl PartialOrd for ScoredTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScoredTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub selected: Vec<TaskId>,
    pub reasoning: Vec<String>,
    pub estimated_total_duration: chrono::Duration,
    pub resource_utilization: f64,
    pub parallelism_factor: f64,
    pub risk_level: RiskLevel,
    pub alternatives: Vec<TaskId>,
}

/// Everything the scoring formula needs about a single task, computed by the
/// caller (engine.rs) from Store + Graph state so the Scheduler stays pure.
#[derive(Debug, Clone)]
pub struct PriorityInput {
    pub task_id: TaskId,
    pub base_priority: Priority,
    pub age: chrono::Duration,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub dependents_count: usize,
    pub system_criticality: f64,
    pub starvation_boost: i64,
    pub category_key: String,
    pub resources: HashSet<String>,
}

pub struct PriorityScheduler {
    config: SchedulerSection,
}

impl PriorityScheduler {
    pub fn new(config: SchedulerSection) -> Self {
        Self { config }
    }

    pub fn update_config(&mut self, config: SchedulerSection) {
        self.config = config;
    }

    /// Computes the dynamic priority score for one task per §4.3's
    /// weighted-product model, clamped to `[1, 2000]`.
    pub fn score(&self, input: &PriorityInput, now: chrono::DateTime<chrono::Utc>) -> f64 {
        let base = input.base_priority.weight() as f64;

        if self.config.scheduling_strategy == SchedulingStrategy::Static {
            return base.clamp(MIN_SCORE, MAX_SCORE);
        }

        let age_hours = input.age.num_seconds() as f64 / 3600.0;
        let age_factor = 1.0 + 0.15 * age_hours.min(48.0) / 24.0;

        let deadline_factor = match input.deadline {
            Some(deadline) => {
                let time_to_deadline = (deadline - now).num_seconds() as f64;
                let one_week = chrono::Duration::weeks(1).num_seconds() as f64;
                if time_to_deadline < 0.0 {
                    2.0
                } else {
                    1.0 + 0.5 * (1.0 - (time_to_deadline / one_week)).max(0.0)
                }
            }
            None => 1.0,
        };

        let dependents_factor = 1.0 + 0.2 * (input.dependents_count as f64) * 0.1;
        let criticality_factor = 1.0 + input.system_criticality * 0.3;

        let mut score = match self.config.scheduling_strategy {
            SchedulingStrategy::Static => base,
            SchedulingStrategy::AgeBased => base * age_factor,
            SchedulingStrategy::DeadlineDriven => base * deadline_factor.powi(2),
            SchedulingStrategy::DependencyAware => base * dependents_factor,
            SchedulingStrategy::WorkloadAdaptive => base * age_factor * criticality_factor,
            SchedulingStrategy::Hybrid => {
                base * age_factor * deadline_factor * dependents_factor * criticality_factor
            }
        };

        score += input.starvation_boost as f64;
        score.clamp(MIN_SCORE, MAX_SCORE)
    }

    pub fn is_starving(&self, age: chrono::Duration) -> bool {
        age.num_milliseconds() as u64 > self.config.max_starvation_time_ms
    }

    pub fn starvation_boost_increment(&self, current_boost: i64) -> i64 {
        (current_boost + 50).min(self.config.max_priority_boost)
    }

    /// Selects up to `slot_count` tasks from the ready set, respecting
    /// resource-pool exclusivity: no two selected tasks share a `resource`.
    pub fn select(
        &self,
        ready: &[ScoredTask],
        slot_count: usize,
        policy: SelectionPolicy,
    ) -> SelectionOutcome {
        if ready.is_empty() || slot_count == 0 {
            return SelectionOutcome {
                selected: Vec::new(),
                reasoning: vec!["ready set empty or no free slots".into()],
                estimated_total_duration: chrono::Duration::zero(),
                resource_utilization: 0.0,
                parallelism_factor: 0.0,
                risk_level: RiskLevel::Low,
                alternatives: Vec::new(),
            };
        }

        let ordered = self.order_by_policy(ready, policy);
        let mut selected = Vec::new();
        let mut used_resources: HashSet<String> = HashSet::new();
        let mut reasoning = Vec::new();

        for candidate in &ordered {
            if selected.len() >= slot_count {
                break;
            }
            if !candidate.resources.is_disjoint(&used_resources) {
                reasoning.push(format!(
                    "{} skipped: resource conflict",
                    candidate.task_id
                ));
                continue;
            }
            used_resources.extend(candidate.resources.iter().cloned());
            reasoning.push(format!(
                "{} selected under {:?} (score {:.1})",
                candidate.task_id, policy, candidate.score
            ));
            selected.push(candidate.task_id.clone());
        }

        let alternatives = ordered
            .iter()
            .map(|c| c.task_id.clone())
            .filter(|id| !selected.contains(id))
            .take(5)
            .collect();

        let parallelism_factor = selected.len() as f64 / slot_count.max(1) as f64;
        let risk_level = if parallelism_factor >= 0.9 {
            RiskLevel::High
        } else if parallelism_factor >= 0.5 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        SelectionOutcome {
            selected,
            reasoning,
            estimated_total_duration: chrono::Duration::zero(),
            resource_utilization: used_resources.len() as f64,
            parallelism_factor,
            risk_level,
            alternatives,
        }
    }

    fn order_by_policy(&self, ready: &[ScoredTask], policy: SelectionPolicy) -> Vec<ScoredTask> {
        match policy {
            SelectionPolicy::StrictPriority => {
                let mut heap: BinaryHeap<ScoredTask> = ready.iter().cloned().collect();
                let mut ordered = Vec::with_capacity(heap.len());
                while let Some(item) = heap.pop() {
                    ordered.push(item);
                }
                ordered
            }
            SelectionPolicy::WeightedRoundRobin | SelectionPolicy::ClassBased => {
                // Group by category/bucket, then interleave round-robin,
                // each bucket internally ordered by score.
                let mut buckets: HashMap<String, Vec<ScoredTask>> = HashMap::new();
                for task in ready {
                    buckets.entry(task.category_key.clone()).or_default().push(task.clone());
                }
                for bucket in buckets.values_mut() {
                    bucket.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
                }
                let mut keys: Vec<String> = buckets.keys().cloned().collect();
                keys.sort();
                let mut ordered = Vec::new();
                loop {
                    let mut progressed = false;
                    for key in &keys {
                        if let Some(bucket) = buckets.get_mut(key) {
                            if !bucket.is_empty() {
                                ordered.push(bucket.remove(0));
                                progressed = true;
                            }
                        }
                    }
                    if !progressed {
                        break;
                    }
                }
                ordered
            }
            SelectionPolicy::FairQueuing => {
                // Favor the oldest tasks first (largest average wait), then score.
                let mut ordered = ready.to_vec();
                ordered.sort_by(|a, b| {
                    b.age_hours
                        .partial_cmp(&a.age_hours)
                        .unwrap()
                        .then_with(|| b.score.partial_cmp(&a.score).unwrap())
                });
                ordered
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(id: &str, priority: Priority, age_hours: i64) -> PriorityInput {
        PriorityInput {
            task_id: TaskId::from(id),
            base_priority: priority,
            age: chrono::Duration::hours(age_hours),
            deadline: None,
            dependents_count: 0,
            system_criticality: 0.0,
            starvation_boost: 0,
            category_key: "feature".into(),
            resources: HashSet::new(),
        }
    }

    #[test]
    fn higher_base_priority_scores_higher_under_hybrid() {
        let mut section = SchedulerSection::default();
        section.scheduling_strategy = SchedulingStrategy::Hybrid;
        let scheduler = PriorityScheduler::new(section);
        let now = chrono::Utc::now();
        let high = scheduler.score(&input("a", Priority::High, 0), now);
        let low = scheduler.score(&input("b", Priority::Low, 0), now);
        assert!(high > low);
    }

    #[test]
    fn static_strategy_ignores_age() {
        let mut section = SchedulerSection::default();
        section.scheduling_strategy = SchedulingStrategy::Static;
        let scheduler = PriorityScheduler::new(section);
        let now = chrono::Utc::now();
        let young = scheduler.score(&input("a", Priority::Normal, 0), now);
        let old = scheduler.score(&input("b", Priority::Normal, 1000), now);
        assert_eq!(young, old);
    }

    #[test]
    fn select_respects_slot_count_and_resource_exclusivity() {
        let scheduler = PriorityScheduler::new(SchedulerSection::default());
        let mut resources_a = HashSet::new();
        resources_a.insert("gpu".to_string());
        let ready = vec![
            ScoredTask { task_id: TaskId::from("a"), score: 100.0, category_key: "feature".into(), resources: resources_a.clone(), age_hours: 1.0 },
            ScoredTask { task_id: TaskId::from("b"), score: 90.0, category_key: "feature".into(), resources: resources_a, age_hours: 1.0 },
        ];
        let outcome = scheduler.select(&ready, 2, SelectionPolicy::StrictPriority);
        assert_eq!(outcome.selected, vec![TaskId::from("a")]);
    }

    #[test]
    fn empty_ready_set_yields_empty_selection() {
        let scheduler = PriorityScheduler::new(SchedulerSection::default());
        let outcome = scheduler.select(&[], 4, SelectionPolicy::StrictPriority);
        assert!(outcome.selected.is_empty());
    }
}
