use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use progression_core::{
    load_upgrade_settings_from_env, recompile_catalog, CatalogCompiler, CompileDiagnostic,
    CompileReport, DiagnosticSeverity, ProgressionRegistry, ResourceAmounts, UpgradeCatalog,
    UpgradeSettings,
};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Compiles and inspects upgrade catalogs", long_about = None)]
struct Cli {
    /// Data folder to compile (defaults to the folder named in UPGRADE_SETTINGS_PATH).
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile the data folder and print every path with its diagnostics.
    Compile {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Exit with an error when any path or series was aborted.
        #[arg(long)]
        strict: bool,
    },
    /// Quote an upgrade for an entity on `path` at level `from`.
    Quote {
        #[arg(long)]
        path: String,
        #[arg(long, default_value_t = 0)]
        from: u32,
        #[arg(long, default_value_t = 1)]
        levels: i32,
        /// Available balance, as `resource=amount`. Repeatable.
        #[arg(long = "resource")]
        resources: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct CompileOutput<'a> {
    fingerprint: u64,
    processed_levels: usize,
    catalog: &'a UpgradeCatalog,
    diagnostics: &'a [CompileDiagnostic],
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let settings = resolve_settings(cli.data);
    let report = compile(&settings)?;

    match cli.command {
        Command::Compile { format, strict } => {
            match format {
                OutputFormat::Text => print_text(&report),
                OutputFormat::Json => {
                    let output = CompileOutput {
                        fingerprint: report.catalog.fingerprint(),
                        processed_levels: report.processed_levels,
                        catalog: &report.catalog,
                        diagnostics: &report.diagnostics,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
            let structural = report.structural_count();
            if strict && structural > 0 {
                bail!("{structural} structural diagnostic(s) reported");
            }
        }
        Command::Quote {
            path,
            from,
            levels,
            resources,
        } => {
            let available = parse_resources(&resources)?;
            let mut registry = ProgressionRegistry::new(Arc::new(report.catalog));
            let id = registry.register(&path, from);
            match registry.check_upgrade(id, levels, &available) {
                Ok(quote) => {
                    println!(
                        "{path}: level {} -> {} takes {}s",
                        quote.from_level, quote.to_level, quote.total_seconds
                    );
                    for (resource, amount) in &quote.total_costs {
                        println!("  {resource}: {amount}");
                    }
                }
                Err(reason) => bail!("upgrade rejected: {reason}"),
            }
        }
    }

    Ok(())
}

fn resolve_settings(data: Option<PathBuf>) -> Arc<UpgradeSettings> {
    let (settings, _) = load_upgrade_settings_from_env();
    match data {
        Some(folder) => Arc::new(settings.as_ref().clone().with_data_folder(folder)),
        None => settings,
    }
}

fn compile(settings: &UpgradeSettings) -> Result<CompileReport> {
    let mut compiler = CatalogCompiler::new();
    let report = recompile_catalog(&mut compiler, settings.data_folder(), settings.field_names())
        .with_context(|| {
            format!(
                "Failed to compile upgrade data in {}",
                settings.data_folder().display()
            )
        })?;
    info!(
        paths = report.catalog.len(),
        diagnostics = report.diagnostics.len(),
        "Compiled upgrade catalog"
    );
    Ok(report)
}

fn print_text(report: &CompileReport) {
    let catalog = &report.catalog;
    println!(
        "{} path(s), {} level(s) processed, fingerprint {:#018x}",
        catalog.len(),
        report.processed_levels,
        catalog.fingerprint()
    );
    for path in catalog.paths() {
        println!("{} (max level {})", path.path_id, path.max_level());
        for (level, requirement) in path.levels.iter().enumerate() {
            let costs = catalog
                .named_costs(requirement)
                .into_iter()
                .map(|(resource, amount)| format!("{resource}={amount}"))
                .collect::<Vec<_>>()
                .join(" ");
            let lock = if requirement.locked { " [locked]" } else { "" };
            println!("  L{level:<3} {:>6}s  {costs}{lock}", requirement.upgrade_seconds);
        }
    }
    if report.diagnostics.is_empty() {
        return;
    }
    println!("diagnostics:");
    for diagnostic in &report.diagnostics {
        let marker = match diagnostic.severity {
            DiagnosticSeverity::Notice => "note",
            DiagnosticSeverity::Malformed => "warn",
            DiagnosticSeverity::Structural => "error",
        };
        println!("  {marker}: {diagnostic}");
    }
}

fn parse_resources(raw: &[String]) -> Result<ResourceAmounts> {
    raw.iter()
        .map(|entry| {
            let (name, amount) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Resource must be in name=amount form: {entry}"))?;
            let amount = amount
                .trim()
                .parse::<i64>()
                .with_context(|| format!("Invalid amount for resource '{name}'"))?;
            Ok((name.trim().to_string(), amount))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_parse_from_pairs() {
        let parsed = parse_resources(&["wood=120".into(), " stone = 4".into()]).unwrap();
        assert_eq!(parsed.get("wood"), Some(&120));
        assert_eq!(parsed.get("stone"), Some(&4));
    }

    #[test]
    fn malformed_resource_is_an_error() {
        assert!(parse_resources(&["wood".into()]).is_err());
        assert!(parse_resources(&["wood=lots".into()]).is_err());
    }

    #[test]
    fn cli_accepts_quote_arguments() {
        let cli = Cli::try_parse_from([
            "catalog_inspector",
            "--data",
            "data/upgrades",
            "quote",
            "--path",
            "barracks",
            "--levels",
            "2",
            "--resource",
            "wood=10",
        ])
        .unwrap();
        assert_eq!(cli.data, Some(PathBuf::from("data/upgrades")));
        match cli.command {
            Command::Quote {
                path, from, levels, ..
            } => {
                assert_eq!(path, "barracks");
                assert_eq!(from, 0);
                assert_eq!(levels, 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
