use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use ums::{Measure, Ums};
use ums_core::config::{
    dialect_from_env_value, ontology_contexts_from_env_value, population_id_from_env_value,
};
use ums_core::{
    ChangeType, CodeOverride, GenerationConfig, MeasureService, OutputFormat, OverrideRequest,
    OverrideStore, ValidationConfig,
};

#[derive(Parser)]
#[command(name = "ums")]
#[command(about = "Universal Measure Specification compiler CLI")]
struct Cli {
    /// JSON file holding saved manual overrides
    #[arg(long, global = true, env = "UMS_OVERRIDE_STORE", default_value = "ums-overrides.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone, Debug, Default)]
struct ConfigArgs {
    /// SQL dialect
    #[arg(long, env = "UMS_SQL_DIALECT")]
    dialect: Option<String>,
    /// Literal population id (default: quoted placeholder)
    #[arg(long, env = "UMS_POPULATION_ID")]
    population_id: Option<String>,
    /// Comma-separated ontology contexts joined into the demographics CTE
    #[arg(long, env = "UMS_ONTOLOGY_CONTEXTS")]
    ontology_contexts: Option<String>,
}

impl ConfigArgs {
    fn generation(&self, generated_at: Option<DateTime<Utc>>) -> anyhow::Result<GenerationConfig> {
        Ok(GenerationConfig {
            dialect: dialect_from_env_value(self.dialect.clone())?,
            population_id: population_id_from_env_value(self.population_id.clone()),
            ontology_contexts: ontology_contexts_from_env_value(self.ontology_contexts.clone()),
            generated_at,
            ..GenerationConfig::default()
        })
    }

    fn validation(&self) -> anyhow::Result<ValidationConfig> {
        Ok(ValidationConfig::from(&self.generation(None)?))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate CQL or SQL from a measure file (YAML or JSON)
    Generate {
        /// Measure file
        measure: PathBuf,
        /// Output format: cql or sql
        #[arg(long, default_value = "cql")]
        format: OutputFormat,
        /// Write the code here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        /// Fixed generation timestamp (RFC 3339) for reproducible output
        #[arg(long)]
        generated_at: Option<DateTime<Utc>>,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Validate generated or hand-written code
    Validate {
        /// Code file
        code: PathBuf,
        /// Format of the code: cql or sql
        #[arg(long, default_value = "sql")]
        format: OutputFormat,
        /// Include the CTE dependency graph and per-CTE details
        #[arg(long)]
        detailed: bool,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Compare two versions of a measure
    Diff {
        old: PathBuf,
        new: PathBuf,
        /// Also diff the generated clinical-query text
        #[arg(long)]
        code: bool,
    },
    /// Manage manual code overrides
    #[command(subcommand)]
    Override(OverrideCommands),
}

#[derive(Subcommand)]
enum OverrideCommands {
    /// Save and lock an override for one component
    Save {
        measure_id: String,
        component_id: String,
        /// File holding the replacement code
        code: PathBuf,
        #[arg(long)]
        format: OutputFormat,
        /// Reason for the edit (at least 10 characters)
        #[arg(long)]
        note: String,
        #[arg(long)]
        change_type: Option<ChangeType>,
        /// File holding the generated code the edit started from
        #[arg(long)]
        original: Option<PathBuf>,
    },
    /// Unlock an override so regeneration uses generated code again
    Revert {
        measure_id: String,
        component_id: String,
        #[arg(long)]
        format: OutputFormat,
    },
    /// List locked overrides of a measure
    List {
        measure_id: String,
        #[arg(long)]
        format: Option<OutputFormat>,
    },
    /// Show the edit history of a component, newest first
    Notes {
        measure_id: String,
        component_id: String,
    },
}

/// What a command printed and whether it succeeded.
struct Outcome {
    output: String,
    success: bool,
}

impl Outcome {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(outcome) => {
            if !outcome.output.is_empty() {
                println!("{}", outcome.output);
            }
            if outcome.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<Outcome> {
    let Some(command) = cli.command else {
        return Ok(Outcome::ok("Use 'ums --help' for commands"));
    };

    match command {
        Commands::Generate {
            measure,
            format,
            out,
            generated_at,
            config,
        } => {
            let measure = read_measure(&measure)?;
            let service = MeasureService::new(Arc::new(load_store(&cli.store)?));
            let result = service.generate(format, &measure, &config.generation(generated_at)?);

            for warning in &result.warnings {
                eprintln!("warning [{:?}]: {}", warning.code, warning.message);
            }
            let Some(code) = result.code else {
                let errors = result.errors.join("\n");
                return Ok(Outcome {
                    output: format!("Generation failed:\n{errors}"),
                    success: false,
                });
            };
            match out {
                Some(path) => {
                    fs::write(&path, &code)
                        .with_context(|| format!("writing {}", path.display()))?;
                    Ok(Outcome::ok(format!("Wrote {} code to {}", format, path.display())))
                }
                None => Ok(Outcome::ok(code)),
            }
        }
        Commands::Validate {
            code,
            format,
            detailed,
            config,
        } => {
            let text = read_text(&code)?;
            let config = config.validation()?;
            let service = MeasureService::new(Arc::new(OverrideStore::new()));
            if detailed {
                let detail = service.validate_detailed(format, &text, &config);
                Ok(Outcome {
                    success: detail.result.valid,
                    output: serde_json::to_string_pretty(&detail)?,
                })
            } else {
                let result = service.validate(format, &text, &config);
                Ok(Outcome {
                    success: result.valid,
                    output: serde_json::to_string_pretty(&result)?,
                })
            }
        }
        Commands::Diff { old, new, code } => {
            let old = read_measure(&old)?;
            let new = read_measure(&new)?;
            let service = MeasureService::new(Arc::new(OverrideStore::new()));
            let diff = if code {
                service.diff_with_code(&old, &new, &GenerationConfig::default())
            } else {
                service.diff(&old, &new)
            };
            Ok(Outcome::ok(serde_json::to_string_pretty(&diff)?))
        }
        Commands::Override(command) => run_override(&cli.store, command),
    }
}

fn run_override(store_path: &Path, command: OverrideCommands) -> anyhow::Result<Outcome> {
    let store = Arc::new(load_store(store_path)?);
    let service = MeasureService::new(store.clone());

    match command {
        OverrideCommands::Save {
            measure_id,
            component_id,
            code,
            format,
            note,
            change_type,
            original,
        } => {
            let original_code = original.as_deref().map(read_text).transpose()?;
            let record = service.save_override(OverrideRequest {
                measure_id,
                component_id,
                format,
                code: read_text(&code)?,
                note,
                change_type,
                original_code,
            })?;
            save_store(store_path, &store)?;
            Ok(Outcome::ok(format!(
                "Saved {} override for {}/{} ({} notes)",
                record.format,
                record.measure_id,
                record.component_id,
                record.notes.len()
            )))
        }
        OverrideCommands::Revert {
            measure_id,
            component_id,
            format,
        } => {
            if service.revert_override(&measure_id, &component_id, format) {
                save_store(store_path, &store)?;
                Ok(Outcome::ok(format!(
                    "Reverted {format} override for {measure_id}/{component_id}"
                )))
            } else {
                Ok(Outcome::ok(format!(
                    "No {format} override for {measure_id}/{component_id}"
                )))
            }
        }
        OverrideCommands::List { measure_id, format } => {
            let overrides = service.overrides_for_measure(&measure_id, format);
            if overrides.is_empty() {
                return Ok(Outcome::ok("No overrides found."));
            }
            let lines: Vec<String> = overrides
                .iter()
                .map(|o| {
                    format!(
                        "{} [{}] updated {} ({} notes)",
                        o.component_id,
                        o.format,
                        o.updated_at.to_rfc3339(),
                        o.notes.len()
                    )
                })
                .collect();
            Ok(Outcome::ok(lines.join("\n")))
        }
        OverrideCommands::Notes {
            measure_id,
            component_id,
        } => {
            let notes = service.all_notes(&measure_id, &component_id);
            if notes.is_empty() {
                return Ok(Outcome::ok("No notes found."));
            }
            let lines: Vec<String> = notes
                .iter()
                .map(|n| {
                    let kind = n.change_type.map(|c| c.to_string()).unwrap_or_default();
                    format!(
                        "{} [{}] {} {}",
                        n.created_at.to_rfc3339(),
                        n.format,
                        kind,
                        n.text
                    )
                })
                .collect();
            Ok(Outcome::ok(lines.join("\n")))
        }
    }
}

fn read_text(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn read_measure(path: &Path) -> anyhow::Result<Measure> {
    let text = read_text(path)?;
    Ums::measure_parse(&text).with_context(|| format!("parsing measure {}", path.display()))
}

/// Loads the override store; a missing file is an empty store.
fn load_store(path: &Path) -> anyhow::Result<OverrideStore> {
    if !path.exists() {
        return Ok(OverrideStore::new());
    }
    let text = read_text(path)?;
    let records: Vec<CodeOverride> = serde_json::from_str(&text)
        .with_context(|| format!("parsing override store {}", path.display()))?;
    Ok(OverrideStore::from_records(records))
}

fn save_store(path: &Path, store: &OverrideStore) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&store.snapshot())?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MEASURE: &str = r#"
id: CMS125
title: Breast Cancer Screening
populations:
  - id: ip
    type: initial_population
    criteria:
      children:
        - kind: element
          id: office-visit
          type: encounter
          description: Office Visit
          valueSet:
            id: vs-visit
            name: Office Visit
            oid: 2.16.840.1.113883.3.464.1003.101.12.1001
  - id: num
    type: numerator
    criteria:
      children:
        - kind: element
          id: mammography
          type: procedure
          description: Mammography
          valueSet:
            id: vs-mammo
            name: Mammography
            oid: 2.16.840.1.113883.3.464.1003.108.12.1018
"#;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let measure = dir.path().join("measure.yaml");
        fs::write(&measure, MEASURE).unwrap();
        let store = dir.path().join("overrides.json");
        (dir, measure, store)
    }

    #[test]
    fn test_generate_writes_reproducible_code() {
        let (dir, measure, store) = setup();
        let out = dir.path().join("out.cql");
        let args = [
            "ums",
            "--store",
            store.to_str().unwrap(),
            "generate",
            measure.to_str().unwrap(),
            "--format",
            "cql",
            "--generated-at",
            "2025-01-15T10:00:00Z",
            "--out",
            out.to_str().unwrap(),
        ];
        let outcome = run(parse(&args)).unwrap();
        assert!(outcome.success);
        let first = fs::read_to_string(&out).unwrap();
        assert!(first.contains("library CMS125"));

        run(parse(&args)).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), first);
    }

    #[test]
    fn test_override_persists_between_invocations() {
        let (dir, measure, store) = setup();
        let code = dir.path().join("num.cql");
        fs::write(&code, "define \"Numerator\":\n  exists [Procedure: \"Mammography\"]").unwrap();
        let store_arg = store.to_str().unwrap();

        let outcome = run(parse(&[
            "ums",
            "--store",
            store_arg,
            "override",
            "save",
            "CMS125",
            "num",
            code.to_str().unwrap(),
            "--format",
            "cql",
            "--note",
            "Drop the lookback window for the pilot",
            "--change-type",
            "logic-fix",
        ]))
        .unwrap();
        assert!(outcome.success);
        assert!(store.exists());

        let listed = run(parse(&["ums", "--store", store_arg, "override", "list", "CMS125"])).unwrap();
        assert!(listed.output.starts_with("num [cql]"));

        let generated = run(parse(&[
            "ums",
            "--store",
            store_arg,
            "generate",
            measure.to_str().unwrap(),
        ]))
        .unwrap();
        assert!(generated.output.contains("MANUAL OVERRIDES APPLIED: 1"));

        let reverted = run(parse(&[
            "ums", "--store", store_arg, "override", "revert", "CMS125", "num", "--format", "cql",
        ]))
        .unwrap();
        assert!(reverted.output.starts_with("Reverted"));

        let notes = run(parse(&["ums", "--store", store_arg, "override", "notes", "CMS125", "num"]))
            .unwrap();
        assert!(notes.output.contains("logic_fix Drop the lookback window"));
    }

    #[test]
    fn test_short_note_is_rejected() {
        let (dir, _, store) = setup();
        let code = dir.path().join("num.sql");
        fs::write(&code, "SELECT 1").unwrap();
        let result = run(parse(&[
            "ums",
            "--store",
            store.to_str().unwrap(),
            "override",
            "save",
            "CMS125",
            "num",
            code.to_str().unwrap(),
            "--format",
            "sql",
            "--note",
            "tweak",
        ]));
        assert!(result.is_err());
        assert!(!store.exists());
    }

    #[test]
    fn test_validate_reports_failure_for_dangerous_sql() {
        let (dir, _, _) = setup();
        let code = dir.path().join("bad.sql");
        fs::write(&code, "TRUNCATE TABLE dbo.PERSON;").unwrap();
        let outcome = run(parse(&["ums", "validate", code.to_str().unwrap()])).unwrap();
        assert!(!outcome.success);
        assert!(outcome.output.contains("DANGEROUS_STATEMENT"));
    }

    #[test]
    fn test_missing_store_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = load_store(&dir.path().join("absent.json")).unwrap();
        assert!(store.snapshot().is_empty());
    }
}
