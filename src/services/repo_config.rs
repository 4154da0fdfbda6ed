//! Repo config parsing and validation.
//!
//! The raw document is parsed strictly, schema-checked, cross-checked for
//! workflow references, converted to [`ValidConfig`], then checked for
//! project-name ambiguity. Each stage stops at the first failure.

use crate::domain::{
    normalize_dir, parse_version, ApplyRequirement, Autoplan, Project, Stage, Step, ValidConfig,
    Workflow, DEFAULT_WORKSPACE,
};
use crate::error::{ConfigError, ConfigResult};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// The only supported config version
const SUPPORTED_VERSION: u32 = 2;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    version: Option<u32>,
    #[serde(default)]
    projects: Vec<RawProject>,
    #[serde(default)]
    workflows: BTreeMap<String, RawWorkflow>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProject {
    name: Option<String>,
    dir: Option<String>,
    workspace: Option<String>,
    terraform_version: Option<String>,
    workflow: Option<String>,
    autoplan: Option<RawAutoplan>,
    apply_requirements: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAutoplan {
    when_modified: Option<Vec<String>>,
    enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorkflow {
    plan: Option<RawStage>,
    apply: Option<RawStage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    #[serde(default)]
    steps: Vec<RawStep>,
}

/// `- init` or `- plan: {extra_args: [..]}` or `- run: cmd`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawStep {
    Key(String),
    Map(BTreeMap<String, serde_yaml::Value>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStepArgs {
    #[serde(default)]
    extra_args: Vec<String>,
}

impl RawConfig {
    fn validate(&self) -> ConfigResult<()> {
        match self.version {
            None => return Err(invalid("version: is required")),
            Some(v) if v != SUPPORTED_VERSION => {
                return Err(invalid(format!(
                    "version: must be {} (got {})",
                    SUPPORTED_VERSION, v
                )))
            }
            Some(_) => {}
        }
        for (i, project) in self.projects.iter().enumerate() {
            project
                .validate()
                .map_err(|msg| invalid(format!("projects[{}].{}", i, msg)))?;
        }
        for (name, workflow) in &self.workflows {
            workflow
                .validate()
                .map_err(|msg| invalid(format!("workflows.{}.{}", name, msg)))?;
        }
        Ok(())
    }
}

impl RawProject {
    fn validate(&self) -> Result<(), String> {
        let dir = match self.dir.as_deref() {
            Some(d) if !d.trim().is_empty() => d,
            _ => return Err("dir: cannot be blank".to_string()),
        };
        let path = Path::new(dir);
        if path.is_absolute() {
            return Err(format!("dir: {:?} must be relative to the repo root", dir));
        }
        if path.components().any(|c| c == Component::ParentDir) {
            return Err("dir: cannot contain '..'".to_string());
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err("name: cannot be blank".to_string());
            }
        }
        if let Some(workspace) = &self.workspace {
            if workspace.trim().is_empty() {
                return Err("workspace: cannot be blank".to_string());
            }
            if workspace.contains('/') {
                return Err("workspace: cannot contain '/'".to_string());
            }
        }
        if let Some(v) = &self.terraform_version {
            parse_version(v).map_err(|e| format!("terraform_version: {}", e))?;
        }
        if let Some(reqs) = &self.apply_requirements {
            for req in reqs {
                parse_apply_requirement(req).map_err(|e| format!("apply_requirements: {}", e))?;
            }
        }
        Ok(())
    }

    fn to_valid(&self) -> Project {
        let mut autoplan = Autoplan::default();
        if let Some(raw) = &self.autoplan {
            if let Some(enabled) = raw.enabled {
                autoplan.enabled = enabled;
            }
            if let Some(when_modified) = &raw.when_modified {
                autoplan.when_modified = when_modified.clone();
            }
        }
        Project {
            dir: normalize_dir(self.dir.as_deref().unwrap_or(".")),
            workspace: self
                .workspace
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string()),
            name: self.name.clone(),
            terraform_version: self
                .terraform_version
                .as_deref()
                .and_then(|v| parse_version(v).ok()),
            workflow: self.workflow.clone(),
            autoplan,
            apply_requirements: self
                .apply_requirements
                .iter()
                .flatten()
                .filter_map(|r| parse_apply_requirement(r).ok())
                .collect(),
        }
    }
}

impl RawWorkflow {
    fn validate(&self) -> Result<(), String> {
        for (stage_name, stage) in [("plan", &self.plan), ("apply", &self.apply)] {
            if let Some(stage) = stage {
                for (i, step) in stage.steps.iter().enumerate() {
                    step.to_step()
                        .map_err(|e| format!("{}.steps[{}]: {}", stage_name, i, e))?;
                }
            }
        }
        Ok(())
    }

    fn to_valid(&self) -> Workflow {
        let stage = |raw: &Option<RawStage>, fallback: Stage| match raw {
            Some(stage) => Stage {
                steps: stage.steps.iter().filter_map(|s| s.to_step().ok()).collect(),
            },
            None => fallback,
        };
        Workflow {
            plan: stage(&self.plan, Stage::default_plan()),
            apply: stage(&self.apply, Stage::default_apply()),
        }
    }
}

impl RawStep {
    fn to_step(&self) -> Result<Step, String> {
        match self {
            Self::Key(key) => builtin_step(key, Vec::new()),
            Self::Map(map) => {
                if map.len() != 1 {
                    return Err(format!(
                        "step must have exactly one key, found {}",
                        map.len()
                    ));
                }
                let (key, value) = map.iter().next().ok_or("step cannot be empty")?;
                if key == "run" {
                    return match value {
                        serde_yaml::Value::String(cmd) if !cmd.trim().is_empty() => {
                            shell_words::split(cmd).map_err(|e| format!("run: {}", e))?;
                            Ok(Step::Run {
                                command: cmd.clone(),
                            })
                        }
                        _ => Err("run: must be a non-empty string".to_string()),
                    };
                }
                if value.is_null() {
                    return builtin_step(key, Vec::new());
                }
                let args: RawStepArgs = serde_yaml::from_value(value.clone())
                    .map_err(|e| format!("{}: {}", key, e))?;
                builtin_step(key, args.extra_args)
            }
        }
    }
}

fn builtin_step(key: &str, extra_args: Vec<String>) -> Result<Step, String> {
    match key {
        "init" => Ok(Step::Init { extra_args }),
        "plan" => Ok(Step::Plan { extra_args }),
        "apply" => Ok(Step::Apply { extra_args }),
        "run" => Err("run: must be given a command".to_string()),
        other => Err(format!(
            "unsupported step {:?}; expected init, plan, apply or run",
            other
        )),
    }
}

fn parse_apply_requirement(raw: &str) -> Result<ApplyRequirement, String> {
    match raw {
        "approved" => Ok(ApplyRequirement::Approved),
        other => Err(format!("{:?} is not a valid apply requirement", other)),
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Reads and validates repo config files
#[derive(Debug, Clone, Default)]
pub struct ParserValidator;

impl ParserValidator {
    pub fn new() -> Self {
        Self
    }

    /// Read the config at `<repo_dir>/<filename>`.
    ///
    /// A missing file yields [`ConfigError::NotFound`] so callers can fall back
    /// to default behaviour.
    pub fn read_config(&self, repo_dir: &Path, filename: &str) -> ConfigResult<ValidConfig> {
        let path = config_path(repo_dir, filename);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ConfigError::NotFound(path)),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        self.parse(&data).map_err(|e| match e {
            ConfigError::Parse(msg) => ConfigError::Parse(format!("parsing {}: {}", filename, msg)),
            ConfigError::Invalid(msg) => {
                ConfigError::Invalid(format!("parsing {}: {}", filename, msg))
            }
            other => other,
        })
    }

    /// Whether `<repo_dir>/<filename>` exists
    pub fn has_config(&self, repo_dir: &Path, filename: &str) -> ConfigResult<bool> {
        let path = config_path(repo_dir, filename);
        match fs::metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    /// Parse and validate raw config bytes
    pub fn parse(&self, data: &[u8]) -> ConfigResult<ValidConfig> {
        let raw: RawConfig =
            serde_yaml::from_slice(data).map_err(|e| ConfigError::Parse(e.to_string()))?;

        raw.validate()?;
        validate_workflows(&raw)?;

        let config = ValidConfig {
            version: raw.version.unwrap_or(SUPPORTED_VERSION),
            projects: raw.projects.iter().map(RawProject::to_valid).collect(),
            workflows: raw
                .workflows
                .iter()
                .map(|(name, wf)| (name.clone(), wf.to_valid()))
                .collect(),
        };
        validate_project_names(&config)?;

        tracing::debug!(
            projects = config.projects.len(),
            workflows = config.workflows.len(),
            "parsed repo config"
        );
        Ok(config)
    }
}

fn config_path(repo_dir: &Path, filename: &str) -> PathBuf {
    repo_dir.join(filename)
}

fn validate_workflows(raw: &RawConfig) -> ConfigResult<()> {
    for project in &raw.projects {
        if let Some(workflow) = &project.workflow {
            if !raw.workflows.contains_key(workflow) {
                return Err(invalid(format!("workflow {:?} is not defined", workflow)));
            }
        }
    }
    Ok(())
}

fn validate_project_names(config: &ValidConfig) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for name in config.projects.iter().filter_map(|p| p.name.as_deref()) {
        if !seen.insert(name) {
            return Err(invalid(format!(
                "found two or more projects with name {:?}; project names must be unique",
                name
            )));
        }
    }

    // Every project sharing a dir/workspace pair must be named, otherwise a
    // targeted apply can't tell them apart.
    let mut pairs: HashMap<(&str, &str), Vec<&Project>> = HashMap::new();
    for project in &config.projects {
        pairs
            .entry((project.dir.as_str(), project.workspace.as_str()))
            .or_default()
            .push(project);
    }
    for project in &config.projects {
        let shared = &pairs[&(project.dir.as_str(), project.workspace.as_str())];
        if shared.len() > 1 && shared.iter().any(|p| p.name.is_none()) {
            return Err(invalid(format!(
                "there are two or more projects with dir: {:?} workspace: {:?} that are not all named; they must have a 'name' key so they can be targeted for apply's separately",
                project.dir, project.workspace
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use tempfile::TempDir;

    fn parse(yaml: &str) -> ConfigResult<ValidConfig> {
        ParserValidator::new().parse(yaml.as_bytes())
    }

    fn err_msg(yaml: &str) -> String {
        parse(yaml).unwrap_err().to_string()
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse("version: 2\nprojects:\n- dir: .\n").unwrap();
        assert_eq!(config.projects.len(), 1);
        let p = &config.projects[0];
        assert_eq!(p.dir, ".");
        assert_eq!(p.workspace, "default");
        assert!(p.autoplan.enabled);
        assert_eq!(p.autoplan.when_modified, vec!["**/*.tf"]);
        assert_eq!(config.workflow_for(p), Workflow::default());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
version: 2
projects:
- name: core
  dir: ./core/
  workspace: staging
  terraform_version: 0.11.7
  workflow: custom
  apply_requirements: [approved]
  autoplan:
    enabled: false
    when_modified: ["*.tf", "../modules/**/*.tf"]
workflows:
  custom:
    plan:
      steps:
      - run: make fmt
      - init:
          extra_args: ["-upgrade"]
      - plan:
          extra_args: ["-var-file", "staging.tfvars"]
"#;
        let config = parse(yaml).unwrap();
        let p = &config.projects[0];
        assert_eq!(p.dir, "core");
        assert_eq!(p.terraform_version, Some(Version::new(0, 11, 7)));
        assert!(p.requires_approval());
        assert!(!p.autoplan.enabled);

        let wf = config.workflow_for(p);
        assert_eq!(
            wf.plan.steps,
            vec![
                Step::Run {
                    command: "make fmt".to_string()
                },
                Step::Init {
                    extra_args: vec!["-upgrade".to_string()]
                },
                Step::Plan {
                    extra_args: vec!["-var-file".to_string(), "staging.tfvars".to_string()]
                },
            ]
        );
        // Apply stage omitted: falls back to the default
        assert_eq!(wf.apply, Stage::default_apply());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse("version: 2\nprojects:\n- dir: .\n  workspce: prod\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("workspce"));
    }

    #[test]
    fn test_version_required() {
        assert!(err_msg("projects:\n- dir: .\n").contains("version"));
        assert!(err_msg("version: 3\n").contains("must be 2"));
    }

    #[test]
    fn test_dir_validation() {
        assert!(err_msg("version: 2\nprojects:\n- workspace: a\n").contains("dir: cannot be blank"));
        assert!(err_msg("version: 2\nprojects:\n- dir: ../other\n").contains(".."));
        assert!(err_msg("version: 2\nprojects:\n- dir: /abs\n").contains("relative"));
    }

    #[test]
    fn test_workspace_without_slash() {
        let msg = err_msg("version: 2\nprojects:\n- dir: .\n  workspace: prod/eu\n");
        assert!(msg.contains("workspace: cannot contain '/'"));
    }

    #[test]
    fn test_bad_terraform_version() {
        let msg = err_msg("version: 2\nprojects:\n- dir: .\n  terraform_version: latest\n");
        assert!(msg.contains("terraform_version"));
    }

    #[test]
    fn test_short_terraform_version_accepted() {
        let config = parse("version: 2\nprojects:\n- dir: .\n  terraform_version: \"0.11\"\n").unwrap();
        assert_eq!(config.projects[0].terraform_version, Some(Version::new(0, 11, 0)));
    }

    #[test]
    fn test_bad_apply_requirement() {
        let msg = err_msg("version: 2\nprojects:\n- dir: .\n  apply_requirements: [mergeable]\n");
        assert!(msg.contains("mergeable"));
    }

    #[test]
    fn test_bad_step() {
        let yaml = "version: 2\nworkflows:\n  w:\n    plan:\n      steps:\n      - destroy\n";
        assert!(err_msg(yaml).contains("unsupported step \"destroy\""));

        let yaml = "version: 2\nworkflows:\n  w:\n    plan:\n      steps:\n      - plan:\n          extra_arg: [x]\n";
        assert!(err_msg(yaml).contains("workflows.w.plan.steps[0]"));
    }

    #[test]
    fn test_run_step_must_be_shell_words() {
        let yaml = "version: 2\nworkflows:\n  w:\n    plan:\n      steps:\n      - run: echo \"unterminated\n";
        assert!(err_msg(yaml).contains("run:"));
    }

    #[test]
    fn test_step_key_without_args() {
        let yaml = "version: 2\nworkflows:\n  w:\n    apply:\n      steps:\n      - apply:\n";
        let config = parse(yaml).unwrap();
        assert_eq!(config.workflows["w"].apply.steps, vec![Step::apply()]);
    }

    #[test]
    fn test_undefined_workflow() {
        let yaml = "version: 2\nprojects:\n- dir: .\n  workflow: custom\nworkflows:\n  other: {}\n";
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("workflow \"custom\" is not defined"));
    }

    #[test]
    fn test_duplicate_names() {
        let yaml = "version: 2\nprojects:\n- name: a\n  dir: one\n- name: a\n  dir: two\n";
        assert!(err_msg(yaml)
            .contains("found two or more projects with name \"a\"; project names must be unique"));
    }

    #[test]
    fn test_shared_pair_requires_names() {
        let yaml = "version: 2\nprojects:\n- dir: vpc\n  workspace: prod\n- name: b\n  dir: vpc\n  workspace: prod\n";
        let msg = err_msg(yaml);
        assert!(msg.contains("dir: \"vpc\" workspace: \"prod\""));

        // Unnamed project listed after the named one fails the same way
        let yaml = "version: 2\nprojects:\n- name: b\n  dir: vpc\n- dir: ./vpc\n";
        assert!(err_msg(yaml).contains("dir: \"vpc\" workspace: \"default\""));
    }

    #[test]
    fn test_shared_pair_all_named_ok() {
        let yaml = "version: 2\nprojects:\n- name: a\n  dir: .\n- name: b\n  dir: .\n- dir: .\n  workspace: other\n";
        assert_eq!(parse(yaml).unwrap().projects.len(), 3);
    }

    #[test]
    fn test_read_config_not_found_is_distinguished() {
        let dir = TempDir::new().unwrap();
        let pv = ParserValidator::new();
        assert!(!pv.has_config(dir.path(), "atlantis.yaml").unwrap());
        let err = pv.read_config(dir.path(), "atlantis.yaml").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_read_config_wraps_errors_with_filename() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("atlantis.yaml"), "version: 2\nbogus: true\n").unwrap();
        let pv = ParserValidator::new();
        assert!(pv.has_config(dir.path(), "atlantis.yaml").unwrap());
        let err = pv.read_config(dir.path(), "atlantis.yaml").unwrap_err();
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("parsing atlantis.yaml"));
    }
}
