use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;

use askmebuddy_core_sdk::{
    buddy::{self, AskError, Buddy, KeyOutcome},
    config::BuddyConfig,
    db,
    models::{ChatMessage, Notice},
    ports::{Notifier, QueuedNotifier},
    server, telemetry,
};

/**
 * \brief CLI 程序入口：终端聊天 + 本地网页。
 */
#[derive(Parser, Debug)]
#[command(name = "askmebuddy", version, about = "AskMeBuddy chat widget")]
struct Cli {
    /** \brief Chat Completions 地址 */
    #[arg(long, global = true)]
    endpoint: Option<String>,
    /** \brief 模型名，指定后会写入配置 */
    #[arg(long, global = true)]
    model: Option<String>,
    /** \brief 数据库文件 */
    #[arg(long, global = true, env = "ASKMEBUDDY_DB", default_value = db::DEFAULT_DB_FILE)]
    db: String,
    /** \brief 日志目录 */
    #[arg(long, global = true, env = "ASKMEBUDDY_LOG_DIR", default_value = telemetry::DEFAULT_LOG_DIR)]
    log_dir: String,
    /** \brief 开启/关闭文件日志，并保存该设置 */
    #[arg(long, global = true)]
    telemetry: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 写入当前用户资料（显示名与别名）。
     */
    Profile {
        #[arg(long, default_value = "me")]
        user_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        alias: String,
    },

    /**
     * \brief 校验并保存 API Key。
     */
    Key {
        #[arg(long)]
        api_key: String,
    },

    /**
     * \brief 提一个问题并打印结果。
     */
    Ask {
        #[arg(long)]
        prompt: String,
    },

    /**
     * \brief 交互式聊天，回车发送，`/quit` 退出。
     */
    Chat,

    /**
     * \brief 启动本地 HTTP 服务并提供聊天页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5174")]
        addr: String,
    },
}

/**
 * \brief 通知直接打印到 stderr。
 */
struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify(&self, notice: Notice) {
        eprintln!("[{}] {}", notice.title, notice.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = db::open_db(&cli.db).context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    if let Some(enabled) = cli.telemetry {
        db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
    }
    telemetry::set_dir(&cli.log_dir);
    telemetry::set_enabled(db::get_telemetry_enabled(&conn).unwrap_or(false));
    if let Some(model) = &cli.model {
        db::set_model(&conn, model).context("save model failed")?;
    }
    let stored_model = db::get_model(&conn).context("load model failed")?;
    let config =
        BuddyConfig::from_env(stored_model).with_overrides(cli.endpoint.clone(), cli.model.clone());

    match cli.command {
        Commands::Profile {
            user_id,
            name,
            alias,
        } => {
            db::upsert_user(&conn, &user_id, &name, &alias).context("save user failed")?;
            db::set_current_user_id(&conn, &user_id).context("save current user failed")?;
            println!("Saved profile {} ({})", name, user_id);
        }
        Commands::Key { api_key } => {
            let buddy = buddy::build_sqlite_buddy(&config, conn, Arc::new(StderrNotifier))?;
            let capture = buddy.save_api_key(&api_key).await;
            match capture.outcome {
                KeyOutcome::Saved => println!("api key saved"),
                KeyOutcome::Unsaved => println!("api key accepted but could not be saved"),
                KeyOutcome::Unreachable => {
                    println!("could not reach {}, api key not saved", config.endpoint)
                }
                KeyOutcome::Required | KeyOutcome::Invalid => {
                    println!("{}", capture.field.validity.unwrap_or_default())
                }
            }
        }
        Commands::Ask { prompt } => {
            let buddy = buddy::build_sqlite_buddy(&config, conn, Arc::new(StderrNotifier))?;
            print_banner(&buddy);
            match buddy.ask(&prompt).await {
                Ok(_) => {
                    for message in buddy.transcript() {
                        print_message(&message);
                    }
                }
                Err(AskError::EmptyQuery) => {}
                Err(e) => println!("{}", e),
            }
        }
        Commands::Chat => {
            let buddy = buddy::build_sqlite_buddy(&config, conn, Arc::new(StderrNotifier))?;
            print_banner(&buddy);
            run_chat(buddy).await?;
        }
        Commands::Serve { addr } => {
            let notices = Arc::new(QueuedNotifier::new());
            let buddy = buddy::build_sqlite_buddy(&config, conn, notices.clone())?;
            server::run(&addr, server::AppState { buddy, notices }).await?;
        }
    }

    Ok(())
}

/**
 * \brief 交互循环：每行输入即一次提交，回复在完成时打印，多个问答可同时进行。
 */
async fn run_chat(buddy: Buddy) -> Result<()> {
    let mut exchanges = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(mut line) = lines.next_line().await.context("read stdin failed")? {
        if line.trim() == "/quit" {
            break;
        }
        match buddy.submit(&mut line) {
            Ok(pending) => {
                exchanges.spawn(async move {
                    for message in pending.settle().await.appended {
                        print_message(&message);
                    }
                });
            }
            Err(AskError::EmptyQuery) => {}
            Err(e) => println!("{}", e),
        }
    }

    // 等待尚未返回的回复。
    while exchanges.join_next().await.is_some() {}
    Ok(())
}

fn print_banner(buddy: &Buddy) {
    let identity = buddy.identity();
    if !identity.display_name.is_empty() {
        println!("[{}] {}", identity.initials, identity.display_name);
    }
    if !buddy.has_key() {
        println!("no api key yet, run: askmebuddy key --api-key <KEY>");
    }
}

fn print_message(message: &ChatMessage) {
    let who = if message.is_assistant() { "buddy" } else { "you" };
    println!("{}> {}", who, message.content);
}
