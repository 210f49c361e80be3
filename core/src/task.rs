//! Weighted tasks executed by the runner

use futures::future::BoxFuture;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;

/// Boxed zero-argument task body
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A named unit of work with a relative selection weight
#[derive(Clone)]
pub struct Task {
    /// Task name, used in logs and panic reports
    pub name: String,

    /// Relative weight; 0 never wins a weighted draw
    pub weight: u32,

    func: TaskFn,
}

impl Task {
    /// Create a task from an async closure
    ///
    /// # Examples
    /// ```
    /// use boomer_core::Task;
    ///
    /// let task = Task::new("ping", 1, || async {
    ///     // call the system under test
    /// });
    /// assert_eq!(task.name, "ping");
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, weight: u32, func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            weight,
            func: Arc::new(move || Box::pin(func())),
        }
    }

    /// Produce the future for one execution of the task body
    pub fn run(&self) -> BoxFuture<'static, ()> {
        (self.func)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

/// Immutable task list with its precomputed total weight
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    tasks: Vec<Task>,
    total_weight: u64,
}

impl TaskSet {
    /// Build a task set
    pub fn new(tasks: Vec<Task>) -> Self {
        let total_weight = tasks.iter().map(|t| u64::from(t.weight)).sum();
        Self {
            tasks,
            total_weight,
        }
    }

    /// Pick the next task to execute
    ///
    /// Draws from the thread-local RNG, so concurrent callers never contend
    /// on shared generator state. With all weights at zero every task is
    /// equally likely.
    pub fn select(&self) -> Option<&Task> {
        match self.tasks.len() {
            0 => None,
            1 => self.tasks.first(),
            len => {
                let mut rng = rand::thread_rng();
                if self.total_weight == 0 {
                    return self.tasks.get(rng.gen_range(0..len));
                }

                let roll = rng.gen_range(0..self.total_weight);
                let mut cumulative = 0u64;
                for task in &self.tasks {
                    cumulative += u64::from(task.weight);
                    if roll < cumulative {
                        return Some(task);
                    }
                }
                self.tasks.last()
            }
        }
    }

    /// Sum of all task weights
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the set has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Iterate over the tasks in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn noop(name: &str, weight: u32) -> Task {
        Task::new(name, weight, || async {})
    }

    fn draw_counts(set: &TaskSet, draws: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..draws {
            let task = set.select().expect("set is not empty");
            *counts.entry(task.name.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_empty_set_selects_nothing() {
        let set = TaskSet::new(vec![]);
        assert!(set.is_empty());
        assert!(set.select().is_none());
    }

    #[test]
    fn test_single_task_fast_path() {
        let set = TaskSet::new(vec![noop("only", 0)]);
        for _ in 0..100 {
            assert_eq!(set.select().unwrap().name, "only");
        }
    }

    #[test]
    fn test_total_weight() {
        let set = TaskSet::new(vec![noop("a", 1), noop("b", 3), noop("c", 6)]);
        assert_eq!(set.total_weight(), 10);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_weighted_selection_fairness() {
        let set = TaskSet::new(vec![noop("light", 1), noop("heavy", 3)]);
        let counts = draw_counts(&set, 100_000);

        let heavy = counts["heavy"];
        // 75% expected, allow a 5% band
        assert!(
            (71_250..=78_750).contains(&heavy),
            "heavy task selected {heavy} times"
        );
        assert_eq!(counts["light"] + heavy, 100_000);
    }

    #[test]
    fn test_zero_weight_task_never_selected() {
        let set = TaskSet::new(vec![noop("never", 0), noop("always", 5)]);
        let counts = draw_counts(&set, 10_000);
        assert_eq!(counts.get("never"), None);
        assert_eq!(counts["always"], 10_000);
    }

    #[test]
    fn test_all_zero_weights_fall_back_to_uniform() {
        let set = TaskSet::new(vec![noop("a", 0), noop("b", 0)]);
        let counts = draw_counts(&set, 20_000);
        assert!(counts["a"] > 8_000, "a selected {} times", counts["a"]);
        assert!(counts["b"] > 8_000, "b selected {} times", counts["b"]);
    }

    #[tokio::test]
    async fn test_task_body_runs() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let task = Task::new("count", 1, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        task.run().await;
        task.run().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(format!("{task:?}").contains("count"));
    }
}
