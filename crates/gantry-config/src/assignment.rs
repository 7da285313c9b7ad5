//! Work assignment parsing.
//!
//! The server normally hands assignments to the agent directly; this format
//! lets an operator run the same job from a file.

use gantry_core::JobIdentifier;
use gantry_core::artifact::{ArtifactPlan, ArtifactStore};
use gantry_core::assignment::{PropertySource, WorkAssignment};
use gantry_core::material::MaterialRevision;
use gantry_core::step::{BuildStep, RunIfConfig, RunIfPolicy, StepKind};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use std::path::PathBuf;

use crate::node::{
    get_all_string_args, get_children_map, get_env_vars, get_first_bool_arg,
    get_first_string_arg, get_int_prop, get_string_prop, require_string_prop,
};
use crate::{ConfigError, ConfigResult};

/// Parse a work assignment from KDL text.
pub fn parse_assignment(kdl: &str) -> ConfigResult<WorkAssignment> {
    let doc: KdlDocument = kdl.parse()?;

    let mut job: Option<JobIdentifier> = None;
    let mut working_dir: Option<PathBuf> = None;
    let mut approver = None;
    let mut fetch_materials = true;
    let mut clean_working_dir = false;
    let mut materials: Vec<MaterialRevision> = Vec::new();
    let mut env = Vec::new();
    let mut steps = Vec::new();
    let mut artifact_plans = Vec::new();
    let mut artifact_stores: Vec<ArtifactStore> = Vec::new();
    let mut properties = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "job" => {
                let locator = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("job locator".to_string()))?;
                let mut id: JobIdentifier =
                    locator.parse().map_err(|e: gantry_core::Error| ConfigError::InvalidValue {
                        field: "job".to_string(),
                        message: e.to_string(),
                    })?;
                if let Some(build_id) = get_int_prop(node, "build-id") {
                    id.build_id = i64::try_from(build_id).map_err(|_| ConfigError::InvalidValue {
                        field: "build-id".to_string(),
                        message: format!("{} is out of range", build_id),
                    })?;
                }
                job = Some(id);
            }
            "working-dir" => {
                working_dir = get_first_string_arg(node).map(PathBuf::from);
            }
            "approver" => {
                approver = get_first_string_arg(node);
            }
            "fetch-materials" => {
                fetch_materials = get_first_bool_arg(node).unwrap_or(true);
            }
            "clean-working-dir" => {
                clean_working_dir = get_first_bool_arg(node).unwrap_or(false);
            }
            "material" => {
                let material = parse_material(node)?;
                if materials.iter().any(|m| m.name == material.name) {
                    return Err(ConfigError::Duplicate(format!("material '{}'", material.name)));
                }
                materials.push(material);
            }
            "env" => env.extend(get_env_vars(node)),
            "steps" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        steps.push(parse_step(child)?);
                    }
                }
            }
            "artifacts" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        artifact_plans.push(parse_artifact(child)?);
                    }
                }
            }
            "store" => {
                let store = parse_store(node)?;
                if artifact_stores.iter().any(|s| s.id == store.id) {
                    return Err(ConfigError::Duplicate(format!("store '{}'", store.id)));
                }
                artifact_stores.push(store);
            }
            "property" => {
                properties.push(parse_property(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let job = job.ok_or_else(|| ConfigError::MissingField("job".to_string()))?;
    let working_dir =
        working_dir.unwrap_or_else(|| PathBuf::from(job.pipeline_name.clone()));

    let mut assignment = WorkAssignment::new(job, working_dir);
    assignment.approver = approver;
    assignment.fetch_materials = fetch_materials;
    assignment.clean_working_dir = clean_working_dir;
    assignment.materials = materials;
    assignment.steps = steps;
    assignment.artifact_plans = artifact_plans;
    assignment.artifact_stores = artifact_stores;
    assignment.properties = properties;
    for var in env {
        assignment.enhance_environment(var);
    }

    assignment
        .validate()
        .map_err(|e| ConfigError::InvalidReference(e.to_string()))?;

    Ok(assignment)
}

fn parse_material(node: &KdlNode) -> ConfigResult<MaterialRevision> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("material name".to_string()))?;

    Ok(MaterialRevision {
        kind: get_string_prop(node, "type").unwrap_or_else(|| "git".to_string()),
        url: require_string_prop(node, "url")?,
        revision: require_string_prop(node, "revision")?,
        destination: get_string_prop(node, "dest"),
        name,
    })
}

fn parse_step(node: &KdlNode) -> ConfigResult<BuildStep> {
    let kind = match node.name().value() {
        "exec" => {
            let mut args = get_all_string_args(node);
            if args.is_empty() {
                return Err(ConfigError::MissingField("command for exec step".to_string()));
            }
            let command = args.remove(0);
            let working_dir = node
                .children()
                .and_then(|c| c.get("working-dir"))
                .and_then(get_first_string_arg);
            StepKind::Command {
                command,
                args,
                working_dir,
            }
        }
        "fetch" => StepKind::FetchArtifact {
            job: require_string_prop(node, "job")?,
            source: require_string_prop(node, "src")?,
            destination: get_string_prop(node, "dest").unwrap_or_default(),
        },
        "kill-children" => StepKind::KillAllChildren,
        "noop" => StepKind::Noop,
        other => {
            return Err(ConfigError::InvalidValue {
                field: "step".to_string(),
                message: format!("unknown step type: {}", other),
            });
        }
    };

    let mut step = BuildStep::new(kind);

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run-if" => {
                    let policies = get_all_string_args(child)
                        .iter()
                        .map(|s| {
                            s.parse::<RunIfPolicy>()
                                .map_err(|e| ConfigError::InvalidValue {
                                    field: "run-if".to_string(),
                                    message: e.to_string(),
                                })
                        })
                        .collect::<ConfigResult<Vec<_>>>()?;
                    step.run_if = RunIfConfig::new(policies);
                }
                "on-cancel" => {
                    let hook = child
                        .children()
                        .and_then(|c| c.nodes().first())
                        .ok_or_else(|| ConfigError::MissingField("on-cancel step".to_string()))?;
                    step.on_cancel = Some(Box::new(parse_step(hook)?));
                }
                _ => {}
            }
        }
    }

    Ok(step)
}

fn parse_artifact(node: &KdlNode) -> ConfigResult<ArtifactPlan> {
    match node.name().value() {
        "build" => Ok(ArtifactPlan::Build {
            source: require_string_prop(node, "src")?,
            destination: get_string_prop(node, "dest").unwrap_or_default(),
        }),
        "external" => Ok(ArtifactPlan::Pluggable {
            id: require_string_prop(node, "id")?,
            store_id: require_string_prop(node, "store")?,
            configuration: get_children_map(node),
        }),
        other => Err(ConfigError::InvalidValue {
            field: "artifact type".to_string(),
            message: format!("unknown artifact type: {}", other),
        }),
    }
}

fn parse_store(node: &KdlNode) -> ConfigResult<ArtifactStore> {
    let id = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("store id".to_string()))?;
    Ok(ArtifactStore {
        plugin_id: require_string_prop(node, "plugin")?,
        configuration: get_children_map(node),
        id,
    })
}

fn parse_property(node: &KdlNode) -> ConfigResult<PropertySource> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("property name".to_string()))?;
    let pattern = require_string_prop(node, "pattern")?;
    Regex::new(&pattern).map_err(|e| ConfigError::InvalidValue {
        field: format!("pattern of property '{}'", name),
        message: e.to_string(),
    })?;

    Ok(PropertySource {
        source: require_string_prop(node, "src")?,
        pattern,
        name,
    })
}
