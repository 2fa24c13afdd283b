use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};
use umongo::migration::MigrationRunner;
use umongo::models::db_config::{DEFAULT_POOL_NAME, Settings};
use umongo::{migration_loader, pool_mgr};

const CONFIG_TEMPLATE: &str = include_str!("../publish/mongodb.yaml");
const DEFAULT_CONFIG: &str = "config/autoload/mongodb.yaml";

#[derive(Parser, Debug)]
#[command(name = "umongo", version, about = "MongoDB 连接池配置发布与数据迁移工具")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 发布 mongodb 配置模板
    Publish {
        /// Publish the configuration for mongodb.
        #[arg(long)]
        config: bool,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        target: PathBuf,
    },
    /// 执行数据迁移
    Migrate {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long, default_value = DEFAULT_POOL_NAME)]
        pool: String,
        /// Force the operation to run when in production.
        #[arg(long)]
        force: bool,
        /// Migration files or directories; defaults to the pool's `migration.path`.
        #[arg(long)]
        path: Vec<PathBuf>,
        /// The given paths are already absolute.
        #[arg(long)]
        realpath: bool,
        /// Also run the seed scripts after migrating.
        #[arg(long)]
        seed: bool,
    },
}

fn publish(config: bool, target: &Path) -> anyhow::Result<()> {
    if !config {
        println!("nothing to publish, pass --config to write the mongodb configuration");
        return Ok(());
    }
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(target, CONFIG_TEMPLATE)
        .with_context(|| format!("failed to write {}", target.display()))?;
    println!("The mongodb configuration file has been generated: {}", target.display());
    Ok(())
}

fn resolve_paths(paths: &[PathBuf], realpath: bool, base: &Path) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|p| if realpath || p.is_absolute() { p.clone() } else { base.join(p) })
        .collect()
}

fn is_production() -> bool {
    std::env::var("APP_ENV").is_ok_and(|env| env.eq_ignore_ascii_case("production"))
}

async fn migrate(
    config: &Path,
    pool: &str,
    force: bool,
    paths: Vec<PathBuf>,
    realpath: bool,
    seed: bool,
) -> anyhow::Result<()> {
    if is_production() && !force {
        bail!("refusing to migrate in production without --force");
    }
    let settings = Settings::from_path(config)?;
    let manager = pool_mgr();
    manager.configure(settings)?;
    let pool_config = manager
        .config(pool)
        .with_context(|| format!("config[mongodb.{pool}] does not exist"))?;

    let base = std::env::current_dir()?;
    let paths = if paths.is_empty() {
        vec![base.join(&pool_config.migration.path)]
    } else {
        resolve_paths(&paths, realpath, &base)
    };

    let runner = MigrationRunner::new(manager.clone(), pool);
    let mut batches = vec![("migration", paths)];
    if seed {
        batches.push(("seed", vec![base.join(&pool_config.migration.seed_path)]));
    }
    for (kind, paths) in batches {
        let migrations = migration_loader::load(&paths)?;
        info!(pool, kind, count = migrations.len(), "running scripts");
        for report in runner.run(migrations).await? {
            println!("{report}");
        }
    }
    manager.close_all();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Publish { config, target } => publish(config, &target),
        Command::Migrate {
            config,
            pool,
            force,
            path,
            realpath,
            seed,
        } => migrate(&config, &pool, force, path, realpath, seed).await,
    }
}
