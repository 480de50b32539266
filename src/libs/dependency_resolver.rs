// Dependency resolution: turns a recipe's declared dependency lists into
// a concrete install order. Build deps come before install deps, which
// come before runtime deps of the same tool; install and runtime deps
// expand transitively, build deps do not (every recipe declares its own
// build tooling). System deps are never installed; they surface as
// preconditions checked before the install loop starts.

use std::collections::BTreeSet;

use crate::error::{Result, TsukuError};
use crate::log_debug;
use crate::schemas::recipe::{Recipe, parse_dependency};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Build,
    Install,
    Runtime,
}

impl DepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepKind::Build => "build",
            DepKind::Install => "install",
            DepKind::Runtime => "runtime",
        }
    }
}

/// The resolved plan-of-attack for one root recipe.
#[derive(Debug, Default)]
pub struct InstallOrder {
    /// Tools to install before the root, in order. No duplicates.
    pub install: Vec<(String, DepKind)>,
    /// Host-provided prerequisites (`system:` entries), root and deps.
    pub system: Vec<String>,
}

/// Resolves the install order for `root`. `load` fetches a dependency's
/// recipe by name; it is consulted only for install/runtime deps, which
/// expand transitively.
pub fn resolve(root: &Recipe, load: &dyn Fn(&str) -> Result<Recipe>) -> Result<InstallOrder> {
    let mut order = InstallOrder::default();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<String> = vec![root.metadata.name.clone()];

    expand(root, load, &mut order, &mut seen, &mut stack, true)?;
    log_debug!(
        "[Deps] {} -> {} install step(s), {} system precondition(s)",
        root.metadata.name,
        order.install.len(),
        order.system.len()
    );
    Ok(order)
}

fn expand(
    recipe: &Recipe,
    load: &dyn Fn(&str) -> Result<Recipe>,
    order: &mut InstallOrder,
    seen: &mut BTreeSet<String>,
    stack: &mut Vec<String>,
    is_root: bool,
) -> Result<()> {
    let metadata = &recipe.metadata;

    // Build deps first. Not expanded transitively: the dep itself installs,
    // but its own build tooling is its recipe's concern at its own install.
    for entry in &metadata.build_dependencies {
        let (name, is_system) = parse_dependency(entry);
        if is_system {
            push_system(order, name);
            continue;
        }
        visit(name, DepKind::Build, load, order, seen, stack, false)?;
    }

    for entry in &metadata.dependencies {
        let (name, is_system) = parse_dependency(entry);
        if is_system {
            push_system(order, name);
            continue;
        }
        visit(name, DepKind::Install, load, order, seen, stack, true)?;
    }

    for entry in &metadata.runtime_dependencies {
        let (name, is_system) = parse_dependency(entry);
        if is_system {
            push_system(order, name);
            continue;
        }
        visit(name, DepKind::Runtime, load, order, seen, stack, true)?;
    }

    let _ = is_root;
    Ok(())
}

fn visit(
    name: &str,
    kind: DepKind,
    load: &dyn Fn(&str) -> Result<Recipe>,
    order: &mut InstallOrder,
    seen: &mut BTreeSet<String>,
    stack: &mut Vec<String>,
    transitive: bool,
) -> Result<()> {
    if stack.iter().any(|entry| entry == name) {
        let mut path: Vec<String> = stack.clone();
        path.push(name.to_string());
        return Err(TsukuError::Validation(vec![crate::error::ValidationIssue::new(
            "dependencies",
            format!("dependency cycle: {}", path.join(" -> ")),
        )]));
    }
    if seen.contains(name) {
        return Ok(());
    }

    let recipe = load(name).map_err(|e| TsukuError::MissingBuildDependency {
        name: name.to_string(),
        reason: e.to_string(),
    })?;

    stack.push(name.to_string());
    if transitive {
        expand(&recipe, load, order, seen, stack, false)?;
    }
    stack.pop();

    seen.insert(name.to_string());
    order.install.push((name.to_string(), kind));
    Ok(())
}

fn push_system(order: &mut InstallOrder, name: &str) {
    if !order.system.iter().any(|entry| entry == name) {
        order.system.push(name.to_string());
    }
}
