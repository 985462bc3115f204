//! Dispatch matching between agent labels and task requirements.

use conveyor_core::task::Labels;

/// A task is eligible for an agent when every label the task declares is
/// advertised by the agent with the same value. Tasks without labels match
/// every agent. Comparison is exact and case-sensitive.
pub fn labels_match(agent_labels: &Labels, task_labels: &Labels) -> bool {
    task_labels
        .iter()
        .all(|(key, value)| agent_labels.get(key) == Some(value))
}

/// Pop filter built from the labels an agent advertises.
#[derive(Debug, Clone, Default)]
pub struct LabelFilter {
    agent_labels: Labels,
}

impl LabelFilter {
    pub fn new(agent_labels: Labels) -> Self {
        Self { agent_labels }
    }

    pub fn accepts(&self, task_labels: &Labels) -> bool {
        labels_match(&self.agent_labels, task_labels)
    }

    pub fn labels(&self) -> &Labels {
        &self.agent_labels
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelFilter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_unlabelled_task_matches_any_agent() {
        assert!(labels_match(&Labels::new(), &Labels::new()));
        assert!(labels_match(&labels(&[("platform", "linux")]), &Labels::new()));
    }

    #[test]
    fn test_every_task_label_must_be_advertised() {
        let agent = labels(&[("platform", "linux/amd64"), ("repo", "public")]);
        assert!(labels_match(&agent, &labels(&[("platform", "linux/amd64")])));
        assert!(labels_match(
            &agent,
            &labels(&[("platform", "linux/amd64"), ("repo", "public")])
        ));
        assert!(!labels_match(
            &agent,
            &labels(&[("platform", "linux/amd64"), ("gpu", "true")])
        ));
    }

    #[test]
    fn test_values_compare_exactly() {
        let agent = labels(&[("platform", "linux/amd64")]);
        assert!(!labels_match(&agent, &labels(&[("platform", "Linux/amd64")])));
        assert!(!labels_match(&agent, &labels(&[("platform", "*")])));
        assert!(!labels_match(&agent, &labels(&[("Platform", "linux/amd64")])));
    }

    #[test]
    fn test_filter_from_pairs() {
        let filter: LabelFilter = [("platform", "windows")].into_iter().collect();
        assert!(filter.accepts(&labels(&[("platform", "windows")])));
        assert!(!filter.accepts(&labels(&[("platform", "linux")])));
        assert_eq!(filter.labels().len(), 1);
    }
}
