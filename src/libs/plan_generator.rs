// Evaluation: recipe -> installation plan.
//
// The generator resolves the version, filters steps against the platform,
// decomposes composites down to primitives, expands template variables,
// binds a checksum and size onto every download, and captures ecosystem
// lockfiles. Any failure aborts the whole eval; no partial plan escapes.

use std::collections::BTreeMap;

use crate::actions::{self, EvalContext, is_ecosystem_primitive};
use crate::error::{Result, TsukuError};
use crate::libs::cancel::CancelToken;
use crate::libs::config::Settings;
use crate::libs::dependency_resolver::{self, InstallOrder};
use crate::libs::predownload::Predownloader;
use crate::libs::utilities::checksum::is_sha256_hex;
use crate::libs::utilities::platform::Platform;
use crate::libs::utilities::templates::TemplateVars;
use crate::schemas::plan::{InstallationPlan, PLAN_FORMAT_VERSION, PlanStep};
use crate::schemas::recipe::{Recipe, Step, params_digest};
use crate::version::{Resolution, VersionRequest};
use crate::{log_debug, log_info};

/// Decomposition is recursive; anything deeper than this is a bug in a
/// composite, not a real recipe.
const MAX_DECOMPOSE_DEPTH: usize = 16;

pub struct PlanGenerator<'a> {
    pub settings: &'a Settings,
    pub platform: &'a Platform,
    pub cancel: &'a CancelToken,
}

impl<'a> PlanGenerator<'a> {
    pub fn new(settings: &'a Settings, platform: &'a Platform, cancel: &'a CancelToken) -> Self {
        Self { settings, platform, cancel }
    }

    /// Evaluates a recipe into a plan. `load_dependency` fetches recipes
    /// for declared dependencies, each of which becomes a sub-plan.
    pub fn generate(
        &self,
        recipe: &Recipe,
        request: &VersionRequest,
        load_dependency: &dyn Fn(&str) -> Result<Recipe>,
    ) -> Result<InstallationPlan> {
        self.generate_inner(recipe, request, load_dependency, 0)
    }

    fn generate_inner(
        &self,
        recipe: &Recipe,
        request: &VersionRequest,
        load_dependency: &dyn Fn(&str) -> Result<Recipe>,
        depth: usize,
    ) -> Result<InstallationPlan> {
        let name = &recipe.metadata.name;
        self.cancel.check()?;

        // Declared platform support is checked before anything network-y.
        if let Some(platforms) = &recipe.metadata.platforms {
            if !platforms.iter().any(|t| t == &self.platform.tuple()) {
                return Err(TsukuError::UnsupportedPlatform {
                    recipe: name.clone(),
                    platform: self.platform.tuple(),
                });
            }
        }

        let resolution = self.resolve_version(recipe, request)?;
        log_info!("[Eval] {} -> {}", name, resolution.version);

        let surviving: Vec<&Step> = recipe
            .steps
            .iter()
            .filter(|step| step.when.as_ref().map(|w| w.matches(self.platform)).unwrap_or(true))
            .collect();
        if surviving.is_empty() {
            return Err(TsukuError::UnsupportedPlatform {
                recipe: name.clone(),
                platform: self.platform.tuple(),
            });
        }

        let vars = TemplateVars::new(&resolution.version, &resolution.tag, self.platform);
        let eval_ctx = EvalContext {
            tool_name: name,
            version: &resolution.version,
            vars: &vars,
            settings: self.settings,
            cancel: self.cancel,
        };

        // Decompose everything to primitives, preserving authoring order.
        let mut primitives: Vec<Step> = Vec::new();
        for step in surviving {
            let mut trail: Vec<String> = Vec::new();
            self.decompose_step(&eval_ctx, step, &mut primitives, &mut trail, 0)?;
        }

        // Resolve parameters and bind checksums/locks.
        let mut plan_steps: Vec<PlanStep> = Vec::with_capacity(primitives.len());
        for step in &primitives {
            plan_steps.push(self.finalize_step(&eval_ctx, step)?);
        }

        let deterministic = !plan_steps.iter().any(|s| is_ecosystem_primitive(&s.action));

        // Sub-plans for every declared dependency, in resolver order.
        let order: InstallOrder = dependency_resolver::resolve(recipe, load_dependency)?;
        let mut dependencies = Vec::with_capacity(order.install.len());
        if depth == 0 {
            for (dep_name, kind) in &order.install {
                log_debug!("[Eval] {} requires {} ({} dep)", name, dep_name, kind.as_str());
                let dep_recipe = load_dependency(dep_name)?;
                let sub_plan = self.generate_inner(
                    &dep_recipe,
                    &VersionRequest::Latest,
                    load_dependency,
                    depth + 1,
                )?;
                dependencies.push(sub_plan);
            }
        }

        // Host-provided (`system:`) prerequisites become probe steps ahead
        // of everything else, so the executor can surface every missing
        // piece before any work starts.
        let mut steps = Vec::with_capacity(order.system.len() + plan_steps.len());
        for system_dep in &order.system {
            let mut probe = PlanStep::new("require_command");
            probe.params.insert("command".to_string(), serde_json::json!(system_dep));
            steps.push(probe);
        }
        steps.extend(plan_steps);

        Ok(InstallationPlan {
            format_version: PLAN_FORMAT_VERSION,
            tool: name.clone(),
            version: resolution.version.clone(),
            platform: self.platform.tuple(),
            generated_at: self.generated_at(),
            recipe_hash: recipe.hash.clone(),
            deterministic,
            steps,
            dependencies,
        })
    }

    /// Timestamp recorded on the plan. Honors SOURCE_DATE_EPOCH so that a
    /// fixed resolver snapshot reproduces byte-identical plans.
    fn generated_at(&self) -> String {
        if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
            if let Ok(seconds) = epoch.parse::<i64>() {
                if let Some(moment) = chrono::DateTime::from_timestamp(seconds, 0) {
                    return moment.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                }
            }
        }
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    /// Resolves through the version registry, or infers the version from a
    /// pinned ecosystem reference when the recipe has no [version] table.
    fn resolve_version(&self, recipe: &Recipe, request: &VersionRequest) -> Result<Resolution> {
        if recipe.version.is_some() {
            return crate::version::resolve(recipe, request);
        }
        for step in &recipe.steps {
            if let Some((version, raw)) =
                actions::ecosystem::pinned_reference(&step.action, &step.params)
            {
                if !request.matches(&version) {
                    return Err(TsukuError::VersionResolution {
                        recipe: recipe.metadata.name.clone(),
                        reason: format!(
                            "recipe pins {version}, which does not satisfy the requested spec"
                        ),
                    });
                }
                return Ok(Resolution { version, tag: raw });
            }
        }
        Err(TsukuError::VersionResolution {
            recipe: recipe.metadata.name.clone(),
            reason: "no [version] section and no version-pinning step".to_string(),
        })
    }

    /// Recursively expands one step until only primitives remain. The trail
    /// of `(action, params)` digests catches decomposition cycles.
    fn decompose_step(
        &self,
        ctx: &EvalContext,
        step: &Step,
        out: &mut Vec<Step>,
        trail: &mut Vec<String>,
        depth: usize,
    ) -> Result<()> {
        self.cancel.check()?;
        if depth > MAX_DECOMPOSE_DEPTH {
            return Err(TsukuError::Execution {
                command: step.action.clone(),
                reason: format!("decomposition deeper than {MAX_DECOMPOSE_DEPTH} levels"),
            });
        }

        let action = actions::lookup(&step.action).ok_or_else(|| {
            TsukuError::Validation(vec![crate::error::ValidationIssue::new(
                "steps",
                format!("unknown action '{}'", step.action),
            )])
        })?;

        if action.kind() == actions::ActionKind::Primitive {
            out.push(step.clone());
            return Ok(());
        }

        let digest = params_digest(&step.action, &step.params);
        if trail.contains(&digest) {
            return Err(TsukuError::Execution {
                command: step.action.clone(),
                reason: "decomposition cycle detected".to_string(),
            });
        }
        trail.push(digest);

        let children = action.decompose(ctx, &step.params)?;
        log_debug!("[Eval] {} -> {} step(s)", step.action, children.len());
        for child in &children {
            self.decompose_step(ctx, child, out, trail, depth + 1)?;
        }
        trail.pop();
        Ok(())
    }

    /// Expands templates and binds checksum/size/locks onto one primitive.
    fn finalize_step(&self, ctx: &EvalContext, step: &Step) -> Result<PlanStep> {
        let expanded = ctx.vars.expand_table(&step.params);
        let mut plan_step = PlanStep::from_params(&step.action, &expanded);

        if step.action == "download_file" {
            // An author-pinned checksum moves onto the step; otherwise the
            // pre-downloader fetches the payload now to compute one.
            match expanded.get("checksum").and_then(|v| v.as_str()) {
                Some(pinned) => {
                    if !is_sha256_hex(pinned) {
                        return Err(TsukuError::Integrity(format!(
                            "recipe pins a malformed checksum: {pinned}"
                        )));
                    }
                    plan_step.checksum = Some(pinned.to_string());
                    plan_step.size = expanded.get("size").and_then(|v| v.as_integer()).map(|s| s as u64);
                    plan_step.params.remove("checksum");
                    plan_step.params.remove("size");
                }
                None => {
                    let url = expanded.get("url").and_then(|v| v.as_str()).ok_or_else(|| {
                        TsukuError::Integrity("download_file without a url".to_string())
                    })?;
                    let fetcher = Predownloader::new(self.settings, self.cancel.clone());
                    let download = fetcher.fetch(url, None)?;
                    plan_step.checksum = Some(download.sha256);
                    plan_step.size = Some(download.size);
                }
            }
        }

        if is_ecosystem_primitive(&step.action) {
            // A locks table already present (pinned by the recipe) wins;
            // otherwise the action's eval hook resolves the dependency set.
            if let Some(toml::Value::Table(pinned)) = expanded.get("locks") {
                let mut locks = BTreeMap::new();
                for (key, value) in pinned {
                    if let Some(text) = value.as_str() {
                        locks.insert(key.clone(), text.to_string());
                    }
                }
                plan_step.locks = Some(locks);
                plan_step.params.remove("locks");
            } else if let Some(action) = actions::lookup(&step.action) {
                plan_step.locks = action.capture_locks(ctx, &expanded)?;
            }
        }

        Ok(plan_step)
    }
}

/// Plan-shape validation shared by the executor and `install --plan`:
/// every step must be a known primitive.
pub fn validate_plan(plan: &InstallationPlan) -> Result<()> {
    if plan.format_version > PLAN_FORMAT_VERSION
        || plan.format_version < crate::schemas::plan::MIN_PLAN_FORMAT_VERSION
    {
        return Err(TsukuError::Validation(vec![crate::error::ValidationIssue::new(
            "format_version",
            format!("unsupported plan format {}", plan.format_version),
        )]));
    }
    let mut issues = Vec::new();
    for (index, step) in plan.steps.iter().enumerate() {
        if !actions::is_primitive(&step.action) {
            issues.push(crate::error::ValidationIssue::new(
                format!("steps[{index}].action"),
                format!("'{}' is not a primitive action", step.action),
            ));
        }
        if step.action == "download_file" {
            if step.param_str("url").is_none() {
                issues.push(crate::error::ValidationIssue::new(
                    format!("steps[{index}].params.url"),
                    "download_file steps must carry a url",
                ));
            }
            match &step.checksum {
                Some(sum) if is_sha256_hex(sum) => {}
                Some(sum) => issues.push(crate::error::ValidationIssue::new(
                    format!("steps[{index}].checksum"),
                    format!("'{sum}' is not a lowercase hex sha256"),
                )),
                None => issues.push(crate::error::ValidationIssue::new(
                    format!("steps[{index}].checksum"),
                    "download_file steps must carry a checksum",
                )),
            }
        }
        if step.action == "install_binaries" && step.param_strings("binaries").is_empty() {
            issues.push(crate::error::ValidationIssue::new(
                format!("steps[{index}].params.binaries"),
                "install_binaries steps must name their binaries",
            ));
        }
    }
    for dependency in &plan.dependencies {
        if let Err(TsukuError::Validation(sub)) = validate_plan(dependency) {
            issues.extend(sub);
        }
    }
    if issues.is_empty() { Ok(()) } else { Err(TsukuError::Validation(issues)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::recipe_loading::load_recipe_str;

    fn no_deps(name: &str) -> Result<Recipe> {
        Err(TsukuError::VersionResolution {
            recipe: name.to_string(),
            reason: "no dependency recipes in this test".to_string(),
        })
    }

    fn generator_fixture() -> (tempfile::TempDir, Settings, Platform, CancelToken) {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::with_home(tmp.path().to_path_buf());
        (
            tmp,
            settings,
            Platform::for_tests("linux", "amd64", Some("debian"), "ubuntu"),
            CancelToken::new(),
        )
    }

    const RG_RECIPE: &str = r#"
        [metadata]
        name = "rg"
        description = "ripgrep"

        [version]
        source = "manual"
        version = "14.1.0"

        [[steps]]
        action = "github_archive"
        repo = "BurntSushi/ripgrep"
        asset = "ripgrep-{version}-x86_64-unknown-linux-musl.tar.gz"
        binaries = ["rg"]
        checksum = "4cf9f2741e6c465ffdb7c26f38056a59e2a2544b51f7cc128ef28337eeae4d8e"

        [verify]
        command = "rg"
        args = ["--version"]
        pattern = "ripgrep {version}"
    "#;

    #[test]
    fn simple_archive_recipe_evaluates_to_the_canonical_plan() {
        let (_tmp, settings, platform, cancel) = generator_fixture();
        let recipe = load_recipe_str(RG_RECIPE).unwrap();
        let generator = PlanGenerator::new(&settings, &platform, &cancel);

        let plan =
            generator.generate(&recipe, &VersionRequest::Latest, &no_deps).unwrap();

        let order: Vec<&str> = plan.steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(order, ["download_file", "extract", "chmod", "install_binaries"]);
        assert!(plan.deterministic);
        assert_eq!(plan.version, "14.1.0");
        assert_eq!(plan.platform, "linux/amd64");
        assert_eq!(plan.format_version, PLAN_FORMAT_VERSION);
        assert_eq!(plan.recipe_hash, recipe.hash);

        let download = &plan.steps[0];
        let url = download.param_str("url").unwrap();
        assert_eq!(
            url,
            "https://github.com/BurntSushi/ripgrep/releases/download/14.1.0/ripgrep-14.1.0-x86_64-unknown-linux-musl.tar.gz"
        );
        assert!(is_sha256_hex(download.checksum.as_deref().unwrap()));
        // The pinned checksum moved off the params and onto the step.
        assert!(!download.params.contains_key("checksum"));

        assert_eq!(plan.steps[1].param_str("format"), Some("tar.gz"));
        assert_eq!(
            plan.steps[1].params.get("strip_dirs").and_then(|v| v.as_u64()),
            Some(1)
        );
        assert_eq!(plan.steps[3].param_strings("binaries"), vec!["rg".to_string()]);

        validate_plan(&plan).unwrap();
    }

    #[test]
    fn when_filtered_steps_are_absent_from_the_plan() {
        let (_tmp, settings, platform, cancel) = generator_fixture();
        let text = r#"
            [metadata]
            name = "multi"
            description = "platform-specific steps"

            [version]
            source = "manual"
            version = "1.0.0"

            [[steps]]
            action = "manual"
            text = "linux step"
            when = { os = ["linux"] }

            [[steps]]
            action = "manual"
            text = "mac arm step"
            when = { platform = ["darwin/arm64"] }

            [[steps]]
            action = "manual"
            text = "everywhere step"

            [verify]
            command = "true"
        "#;
        let recipe = load_recipe_str(text).unwrap();
        let generator = PlanGenerator::new(&settings, &platform, &cancel);
        let plan = generator.generate(&recipe, &VersionRequest::Latest, &no_deps).unwrap();

        let texts: Vec<&str> =
            plan.steps.iter().filter_map(|s| s.param_str("text")).collect();
        assert_eq!(texts, ["linux step", "everywhere step"]);
    }

    #[test]
    fn no_surviving_steps_is_unsupported_platform() {
        let (_tmp, settings, platform, cancel) = generator_fixture();
        let text = r#"
            [metadata]
            name = "maconly"
            description = "darwin only"

            [version]
            source = "manual"
            version = "1.0.0"

            [[steps]]
            action = "manual"
            text = "mac"
            when = { os = ["darwin"] }

            [verify]
            command = "true"
        "#;
        let recipe = load_recipe_str(text).unwrap();
        let generator = PlanGenerator::new(&settings, &platform, &cancel);
        let err = generator.generate(&recipe, &VersionRequest::Latest, &no_deps).unwrap_err();
        assert_eq!(err.kind(), "unsupported-platform");
    }

    #[test]
    fn declared_platforms_gate_evaluation() {
        let (_tmp, settings, platform, cancel) = generator_fixture();
        let text = r#"
            [metadata]
            name = "maconly"
            description = "darwin only"
            platforms = ["darwin/arm64"]

            [version]
            source = "manual"
            version = "1.0.0"

            [[steps]]
            action = "manual"
            text = "mac"

            [verify]
            command = "true"
        "#;
        let recipe = load_recipe_str(text).unwrap();
        let generator = PlanGenerator::new(&settings, &platform, &cancel);
        let err = generator.generate(&recipe, &VersionRequest::Latest, &no_deps).unwrap_err();
        assert_eq!(err.kind(), "unsupported-platform");
    }

    #[test]
    fn ecosystem_plans_are_marked_non_deterministic() {
        let (_tmp, settings, platform, cancel) = generator_fixture();
        let text = r#"
            [metadata]
            name = "lazygit"
            description = "git tui"

            [[steps]]
            action = "go_install"
            module = "github.com/jesseduffield/lazygit@v0.40.2"
            [steps.params.locks]
            go_sum = "github.com/jesseduffield/lazygit v0.40.2 h1:stub"
            toolchain = "go version go1.22.0 linux/amd64"

            [verify]
            command = "lazygit"
            pattern = "version={version}"
        "#;
        let recipe = load_recipe_str(text).unwrap();
        let generator = PlanGenerator::new(&settings, &platform, &cancel);
        let plan = generator.generate(&recipe, &VersionRequest::Latest, &no_deps).unwrap();

        assert!(!plan.deterministic);
        assert_eq!(plan.version, "0.40.2");
        let build = plan.steps.iter().find(|s| s.action == "go_build").unwrap();
        let locks = build.locks.as_ref().unwrap();
        assert!(locks.get("go_sum").unwrap().contains("lazygit"));
        assert_eq!(build.param_str("version"), Some("0.40.2"));
        // The probe decomposed ahead of the build step.
        assert_eq!(plan.steps[0].action, "require_command");
    }

    #[test]
    fn plans_are_byte_identical_for_fixed_inputs() {
        let (_tmp, settings, platform, cancel) = generator_fixture();
        // SAFETY: test-local env var, no concurrent env readers in this test.
        unsafe { std::env::set_var("SOURCE_DATE_EPOCH", "1735689600") };
        let recipe = load_recipe_str(RG_RECIPE).unwrap();
        let generator = PlanGenerator::new(&settings, &platform, &cancel);

        let a = generator.generate(&recipe, &VersionRequest::Latest, &no_deps).unwrap();
        let b = generator.generate(&recipe, &VersionRequest::Latest, &no_deps).unwrap();
        let json_a = serde_json::to_string_pretty(&a).unwrap();
        let json_b = serde_json::to_string_pretty(&b).unwrap();
        assert_eq!(json_a, json_b);
        unsafe { std::env::remove_var("SOURCE_DATE_EPOCH") };
    }

    #[test]
    fn system_dependencies_become_leading_probe_steps() {
        let (_tmp, settings, platform, cancel) = generator_fixture();
        let text = r#"
            [metadata]
            name = "gitui"
            description = "git tui"
            dependencies = ["system:git"]

            [version]
            source = "manual"
            version = "1.0.0"

            [[steps]]
            action = "manual"
            text = "done"

            [verify]
            command = "gitui"
        "#;
        let recipe = load_recipe_str(text).unwrap();
        let generator = PlanGenerator::new(&settings, &platform, &cancel);
        let plan = generator.generate(&recipe, &VersionRequest::Latest, &no_deps).unwrap();

        assert_eq!(plan.steps[0].action, "require_command");
        assert_eq!(plan.steps[0].param_str("command"), Some("git"));
        assert_eq!(plan.steps[1].action, "manual");
        assert!(plan.dependencies.is_empty());
    }

    #[test]
    fn validate_plan_rejects_composites_and_missing_checksums() {
        let mut plan = InstallationPlan {
            format_version: PLAN_FORMAT_VERSION,
            tool: "t".into(),
            version: "1".into(),
            platform: "linux/amd64".into(),
            generated_at: "2026-01-01T00:00:00Z".into(),
            recipe_hash: "00".into(),
            deterministic: true,
            steps: vec![PlanStep::new("download_archive"), PlanStep::new("download_file")],
            dependencies: vec![],
        };
        let err = validate_plan(&plan).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("not a primitive"));
        assert!(text.contains("must carry a checksum"));

        plan.steps = vec![];
        plan.format_version = 99;
        assert!(validate_plan(&plan).is_err());
    }
}
