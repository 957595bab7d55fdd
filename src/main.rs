use anyhow::{Context, Result};
use bucketsync::core::{HashCopier, SyncStatus};
use bucketsync::core::naming::{name_for_path, DEFAULT_EXTENSIONS};
use bucketsync::logging::{LogConfig, SizeRotatingWriter};
use bucketsync::{AppConfig, AppContext, Direction, StoreInstance, SyncPlan};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "bucketsync", version, about = "本地目录与 S3 兼容存储之间的镜像同步")]
struct Cli {
    /// 数据目录（配置、同步计划、存储实例、日志）
    #[arg(long, global = true, env = "BUCKETSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 管理同步计划
    #[command(subcommand)]
    Plan(PlanCommand),
    /// 管理存储实例
    #[command(subcommand)]
    Instance(InstanceCommand),
    /// 执行同步计划
    Sync {
        plan_id: Uuid,
        /// 只计算差异，不执行
        #[arg(long)]
        dry_run: bool,
        /// 覆盖配置中的并发数
        #[arg(long)]
        concurrency: Option<usize>,
        /// 覆盖计划中的同步方向（mirror-to-remote / mirror-to-local）
        #[arg(long)]
        direction: Option<Direction>,
        /// 追加排除的路径 glob，逗号分隔
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
    },
    /// 按内容哈希重命名复制文件
    HashCopy {
        #[arg(long)]
        from: PathBuf,
        #[arg(long)]
        to: PathBuf,
        /// 逗号分隔的扩展名，大小写不敏感
        #[arg(long, value_delimiter = ',')]
        ext: Vec<String>,
        /// 复制成功后将源文件移入回收站
        #[arg(long = "move")]
        move_after_copy: bool,
    },
    /// 输出文件的内容名称
    Name { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum PlanCommand {
    List,
    Add {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        instance: String,
        #[arg(long)]
        local: PathBuf,
        #[arg(long, default_value = "")]
        remote: String,
        #[arg(long, default_value_t = Direction::MirrorToRemote)]
        direction: Direction,
    },
    Remove { id: Uuid },
}

#[derive(Subcommand, Debug)]
enum InstanceCommand {
    List,
    Add {
        #[arg(long)]
        id: String,
        #[arg(long, env = "AWS_ACCESS_KEY_ID")]
        access_key_id: String,
        #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
        secret_access_key: String,
        #[arg(long, default_value = "us-east-1")]
        region: String,
        #[arg(long)]
        endpoint: String,
    },
    Remove { id: String },
}

/// 控制台输出层：debug 构建按配置级别输出，release 构建只输出警告和错误
fn console_layer<S>(config: &LogConfig) -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let level = if cfg!(debug_assertions) && config.enabled {
        LevelFilter::from_level(config.tracing_level())
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(level)
}

/// 初始化日志系统
fn init_logging(log_dir: &Path, config: &LogConfig) -> Option<WorkerGuard> {
    if !config.enabled {
        // 日志文件已禁用，警告仍输出到控制台
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(console_layer(config)),
        );
        return None;
    }

    // 创建日志级别过滤器
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into());

    match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let (writer, guard) = file_writer.non_blocking();
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer(config));
            let _ = tracing::subscriber::set_global_default(subscriber);
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            eprintln!("无法创建日志文件: {}", e);
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
            let _ = tracing::subscriber::set_global_default(subscriber);
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(bucketsync::config::data_dir);

    // 先装好日志，计划和实例记录的校验警告才不会丢失
    let config = AppConfig::load(&data_dir);
    let _guard = init_logging(&data_dir, &config.log);

    let ctx = match AppContext::open(data_dir, config) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("初始化失败: {:#}", e);
            eprintln!("初始化失败: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, ctx).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, mut ctx: AppContext) -> Result<ExitCode> {
    match command {
        Command::Plan(PlanCommand::List) => {
            for plan in ctx.plans.list() {
                println!(
                    "{}  {} -> {}/{} [{}] ({})",
                    plan.id,
                    plan.local_dir.display(),
                    plan.bucket,
                    plan.remote_dir,
                    plan.store_instance_id,
                    plan.direction
                );
            }
        }
        Command::Plan(PlanCommand::Add {
            bucket,
            instance,
            local,
            remote,
            direction,
        }) => {
            if ctx.instances.find(&instance).is_none() {
                anyhow::bail!("未找到存储实例: {}", instance);
            }
            let plan = SyncPlan::new(bucket, instance, local, remote).with_direction(direction);
            let id = plan.id;
            ctx.plans.add(plan)?;
            println!("{}", id);
        }
        Command::Plan(PlanCommand::Remove { id }) => {
            if !ctx.plans.delete(&id)? {
                anyhow::bail!("未找到同步计划: {}", id);
            }
        }
        Command::Instance(InstanceCommand::List) => {
            for instance in ctx.instances.list() {
                println!(
                    "{}  {} ({})",
                    instance.s3_instance_id, instance.endpoint_url, instance.region
                );
            }
        }
        Command::Instance(InstanceCommand::Add {
            id,
            access_key_id,
            secret_access_key,
            region,
            endpoint,
        }) => {
            ctx.instances.add(StoreInstance {
                s3_instance_id: id,
                access_key_id,
                secret_access_key,
                region,
                endpoint_url: endpoint,
            })?;
        }
        Command::Instance(InstanceCommand::Remove { id }) => {
            if !ctx.instances.remove(&id)? {
                anyhow::bail!("未找到存储实例: {}", id);
            }
        }
        Command::Sync {
            plan_id,
            dry_run,
            concurrency,
            direction,
            exclude,
        } => {
            let mut plan = ctx
                .plans
                .get(&plan_id)
                .cloned()
                .with_context(|| format!("未找到同步计划: {}", plan_id))?;
            if let Some(direction) = direction {
                plan.direction = direction;
            }
            if let Some(limit) = concurrency {
                ctx.config.sync.concurrency_limit = limit.max(1);
            }
            ctx.config.sync.exclude_patterns.extend(exclude);

            let engine = ctx.engine();

            if dry_run {
                for action in engine.plan(&plan).await? {
                    println!("{}", action);
                }
                return Ok(ExitCode::SUCCESS);
            }

            let cancel = engine.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("收到中断信号，当前动作完成后停止");
                    cancel.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            });

            let report = engine.run(&plan).await?;
            for (key, reason) in &report.execution.failed {
                eprintln!("失败: {}: {}", key, reason);
            }
            println!(
                "成功 {}, 失败 {}, 跳过 {}",
                report.execution.succeeded.len(),
                report.execution.failed.len(),
                report.execution.skipped.len()
            );
            if report.status != SyncStatus::Completed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::HashCopy {
            from,
            to,
            ext,
            move_after_copy,
        } => {
            let copier = if ext.is_empty() {
                HashCopier::new(DEFAULT_EXTENSIONS)
            } else {
                HashCopier::new(&ext[..])
            };
            let copier = if move_after_copy {
                copier.with_move(ctx.config.sync.trash_bin())
            } else {
                copier
            };

            let report = copier.copy(&from, &to).await?;
            for (source, dest) in &report.copied {
                println!("{} -> {}", source.display(), dest.display());
            }
            for (source, reason) in &report.failed {
                eprintln!("失败: {}: {}", source.display(), reason);
            }
            println!(
                "复制 {}, 已存在 {}, 失败 {}",
                report.copied.len(),
                report.already_present.len(),
                report.failed.len()
            );
            if !report.failed.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Name { file } => {
            println!("{}", name_for_path(&file).await?);
        }
    }
    Ok(ExitCode::SUCCESS)
}
