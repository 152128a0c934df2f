//! Turns an approved plan into task rows and dependency edges: validates the
//! plan's dependency graph is acyclic, assigns wave numbers, builds each
//! task's initial context, and picks a model tier + tool set per
//! `(task_type, complexity)`. Grounded on the decomposer/model-router
//! services' DFS-cycle-check + Kahn's-algorithm-wave-assignment shape.

mod tables;

use std::collections::HashMap;

use crate::domain::{ContextEntry, Plan, PlanOutput, PlanStatus, PlannedTask, Project, ProjectStatus, Task};
use crate::error::{OrchError, Result};
use crate::store::{plan_repo, project_repo, task_repo, Store};

pub use tables::{default_tools, model_tier_for};

/// How many characters of a sibling task's description survive in the
/// per-task "what else is happening" digest.
const SIBLING_DESCRIPTION_TRUNCATE: usize = 160;

/// Validate, wave-assign, and persist all tasks for an approved plan.
/// `plan.status` must be `draft`; on success the plan becomes `approved` and
/// the project becomes `ready`. Returns the persisted tasks in wave order.
pub fn decompose(store: &Store, project_id: &str, plan_id: &str) -> Result<Vec<Task>> {
    let (project, plan) = store.with_conn(|conn| {
        let project = project_repo::get_project(conn, project_id)?;
        let plan = plan_repo::get_plan(conn, plan_id)?;
        Ok((project, plan))
    })?;

    if plan.status != PlanStatus::Draft {
        return Err(OrchError::invalid_state("plan", plan.status.as_str(), "approved"));
    }

    let flattened = plan.output.flatten();
    if flattened.is_empty() {
        return Err(OrchError::invalid_state("plan", "draft", "approved (no tasks)"));
    }

    let titles: Vec<&str> = flattened.iter().map(|(_, t)| t.title.as_str()).collect();
    detect_cycle(&titles, &flattened)?;
    let waves = compute_waves(&titles, &flattened);

    let tasks = build_tasks(&project, &plan, &flattened, &waves);

    store.with_tx(|tx| {
        for task in &tasks {
            task_repo::create_task(tx, task)?;
        }
        let by_title: HashMap<&str, &Task> = tasks.iter().map(|t| (t.title.as_str(), t)).collect();
        for (_, planned) in &flattened {
            let Some(task) = by_title.get(planned.title.as_str()) else { continue };
            for dep_title in &planned.depends_on {
                if let Some(dep_task) = by_title.get(dep_title.as_str()) {
                    task_repo::add_dependency(tx, &task.id, &dep_task.id)?;
                }
            }
        }
        plan_repo::set_plan_status(tx, plan_id, PlanStatus::Approved)?;
        project_repo::update_project_status(tx, project_id, ProjectStatus::Ready)?;
        Ok(())
    })?;

    store.with_conn(|conn| task_repo::mark_blocked(conn, project_id))?;

    Ok(tasks)
}

/// Iterative three-color DFS. On the first back-edge, returns `CycleDetected`
/// naming the two offending titles.
fn detect_cycle(titles: &[&str], flattened: &[(Option<&str>, &PlannedTask)]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let index_of: HashMap<&str, usize> = titles.iter().enumerate().map(|(i, t)| (*t, i)).collect();
    let adj: Vec<Vec<usize>> = flattened
        .iter()
        .map(|(_, t)| t.depends_on.iter().filter_map(|d| index_of.get(d.as_str()).copied()).collect())
        .collect();

    let mut color = vec![Color::White; titles.len()];
    for start in 0..titles.len() {
        if color[start] != Color::White {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        color[start] = Color::Gray;
        while let Some(&mut (node, ref mut next_child)) = stack.last_mut() {
            if *next_child < adj[node].len() {
                let child = adj[node][*next_child];
                *next_child += 1;
                match color[child] {
                    Color::White => {
                        color[child] = Color::Gray;
                        stack.push((child, 0));
                    }
                    Color::Gray => return Err(OrchError::cycle_detected(titles[node], titles[child])),
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm: wave(t) = 0 if no predecessors, else 1 + max(wave(p)).
/// Traversed breadth-first by in-degree, which yields the same result and
/// gives waves in a single ordered pass.
fn compute_waves(titles: &[&str], flattened: &[(Option<&str>, &PlannedTask)]) -> Vec<i32> {
    let index_of: HashMap<&str, usize> = titles.iter().enumerate().map(|(i, t)| (*t, i)).collect();
    let preds: Vec<Vec<usize>> = flattened
        .iter()
        .map(|(_, t)| t.depends_on.iter().filter_map(|d| index_of.get(d.as_str()).copied()).collect())
        .collect();

    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); titles.len()];
    let mut indegree: Vec<usize> = vec![0; titles.len()];
    for (i, p) in preds.iter().enumerate() {
        indegree[i] = p.len();
        for &pred in p {
            succs[pred].push(i);
        }
    }

    let mut wave = vec![0i32; titles.len()];
    let mut queue: std::collections::VecDeque<usize> = (0..titles.len()).filter(|&i| indegree[i] == 0).collect();
    let mut remaining = indegree.clone();

    while let Some(node) = queue.pop_front() {
        for &succ in &succs[node] {
            wave[succ] = wave[succ].max(wave[node] + 1);
            remaining[succ] -= 1;
            if remaining[succ] == 0 {
                queue.push_back(succ);
            }
        }
    }
    wave
}

fn build_tasks(project: &Project, plan: &Plan, flattened: &[(Option<&str>, &PlannedTask)], waves: &[i32]) -> Vec<Task> {
    let descriptions: Vec<(&str, &str)> = flattened.iter().map(|(_, t)| (t.title.as_str(), t.description.as_str())).collect();

    flattened
        .iter()
        .enumerate()
        .map(|(i, (phase, planned))| {
            let tier = model_tier_for(&planned.task_type, &planned.complexity);
            let tools = default_tools(&planned.task_type);

            let mut task = Task::new(&project.id, &plan.id, &planned.title, &planned.description, &planned.task_type, tier, i as i32);
            task.wave = waves[i];
            task.phase = phase.map(String::from);
            task.tools = tools;
            task.verification_criteria = planned.verification_criteria.clone();
            task.affected_files = planned.affected_files.clone();
            task.push_context(brief_context(project, plan, planned, phase, &descriptions));
            task
        })
        .collect()
}

fn brief_context(
    project: &Project,
    plan: &Plan,
    planned: &PlannedTask,
    phase: Option<&str>,
    descriptions: &[(&str, &str)],
) -> ContextEntry {
    let siblings: Vec<String> = descriptions
        .iter()
        .filter(|(title, _)| *title != planned.title)
        .map(|(title, desc)| format!("- {title}: {}", truncate(desc, SIBLING_DESCRIPTION_TRUNCATE)))
        .collect();

    let brief = serde_json::json!({
        "project_summary": plan.output.summary,
        "project_requirements": project.requirements,
        "task_description": planned.description,
        "phase": phase,
        "sibling_tasks": siblings,
        "verification_criteria": planned.verification_criteria,
        "affected_files": planned.affected_files,
    });
    ContextEntry::new("task_brief", brief.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

/// Satisfy the unused-import check when `PlanOutput` is only referenced via
/// the `Plan` argument's field type in doc examples.
#[allow(unused_imports)]
use PlanOutput as _PlanOutputRef;
