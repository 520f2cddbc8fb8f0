use std::collections::{HashMap, HashSet, VecDeque};

use crate::view::ContainerSnapshot;

/// Orders containers so a container is processed after everything it
/// depends on. Grouped by compose project (or ungrouped); within a group of
/// size greater than one, a Kahn's-algorithm toposort is attempted restricted
/// to dependency edges whose target is present in that same group. A cycle
/// (the sort fails to consume every node) falls back to lexicographic order
/// of base names. Groups are concatenated in first-seen order.
pub fn order(containers: Vec<ContainerSnapshot>) -> Vec<ContainerSnapshot> {
    let mut group_order: Vec<Option<String>> = Vec::new();
    let mut groups: HashMap<Option<String>, Vec<ContainerSnapshot>> = HashMap::new();

    for container in containers {
        let key = container.compose_project.clone();
        if !groups.contains_key(&key) {
            group_order.push(key.clone());
        }
        groups.entry(key).or_default().push(container);
    }

    let mut ordered = Vec::new();
    for key in group_order {
        let group = groups.remove(&key).unwrap_or_default();
        if group.len() <= 1 {
            ordered.extend(group);
            continue;
        }
        ordered.extend(toposort_or_lexicographic(group));
    }
    ordered
}

fn toposort_or_lexicographic(mut group: Vec<ContainerSnapshot>) -> Vec<ContainerSnapshot> {
    let names: HashSet<String> = group.iter().map(|c| c.base_name.clone()).collect();

    let mut in_degree: HashMap<String, usize> = names.iter().map(|n| (n.clone(), 0)).collect();
    let mut dependents: HashMap<String, Vec<String>> = names.iter().map(|n| (n.clone(), Vec::new())).collect();

    for container in &group {
        for dependency in &container.depends_on {
            if names.contains(dependency) && dependency != &container.base_name {
                *in_degree.get_mut(&container.base_name).expect("name in group") += 1;
                dependents.get_mut(dependency).expect("name in group").push(container.base_name.clone());
            }
        }
    }

    let mut ready: VecDeque<String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| name.clone())
        .collect();
    let mut ready_sorted: Vec<String> = ready.drain(..).collect();
    ready_sorted.sort();
    let mut queue: VecDeque<String> = ready_sorted.into();

    let mut resolved_order = Vec::new();
    while let Some(name) = queue.pop_front() {
        resolved_order.push(name.clone());
        let mut newly_ready = Vec::new();
        for dependent in dependents.get(&name).cloned().unwrap_or_default() {
            let degree = in_degree.get_mut(&dependent).expect("dependent tracked");
            *degree -= 1;
            if *degree == 0 {
                newly_ready.push(dependent);
            }
        }
        newly_ready.sort();
        for name in newly_ready {
            queue.push_back(name);
        }
    }

    if resolved_order.len() != names.len() {
        group.sort_by(|a, b| a.base_name.cmp(&b.base_name));
        return group;
    }

    let mut by_name: HashMap<String, ContainerSnapshot> =
        group.into_iter().map(|c| (c.base_name.clone(), c)).collect();
    resolved_order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::view::HealthStatus;

    fn container(name: &str, project: Option<&str>, depends_on: &[&str]) -> ContainerSnapshot {
        ContainerSnapshot {
            id: name.to_string(),
            name: name.to_string(),
            base_name: name.to_string(),
            compose_project: project.map(String::from),
            image_id: "sha256:x".to_string(),
            image_ref: "demo:latest".to_string(),
            labels: HashMap::new(),
            running: true,
            health_status: HealthStatus::Healthy,
            started_at: None,
            has_healthcheck: false,
            healthcheck_test: None,
            host_config: crate::view::HostConfig::default(),
            mounts: Vec::new(),
            networks: Vec::new(),
            platform_managed: false,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orders_dependencies_before_dependents() {
        let containers = vec![
            container("web", Some("stack"), &["db", "cache"]),
            container("db", Some("stack"), &[]),
            container("cache", Some("stack"), &[]),
        ];
        let ordered = order(containers);
        let names: Vec<&str> = ordered.iter().map(|c| c.name.as_str()).collect();
        let web_pos = names.iter().position(|n| *n == "web").unwrap();
        let db_pos = names.iter().position(|n| *n == "db").unwrap();
        let cache_pos = names.iter().position(|n| *n == "cache").unwrap();
        assert!(db_pos < web_pos);
        assert!(cache_pos < web_pos);
    }

    #[test]
    fn falls_back_to_lexicographic_order_on_a_cycle() {
        let containers = vec![
            container("b", Some("stack"), &["a"]),
            container("a", Some("stack"), &["b"]),
        ];
        let ordered = order(containers);
        let names: Vec<&str> = ordered.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn groups_without_a_compose_project_are_left_alone() {
        let containers = vec![container("solo", None, &[])];
        let ordered = order(containers);
        assert_eq!(ordered.len(), 1);
    }
}
