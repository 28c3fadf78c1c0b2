//! lx - Command-line front end for the lixian client.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};

use lixian::format::format_speed;
use lixian::{AppConfig, Error, Session, Task};

// ============================================================================
// Command Parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Login,
    List(Option<String>),
    Deleted,
    Expired,
    Info(String),
    Add(Vec<String>),
    Batch(Vec<String>),
    Remove(Vec<String>),
    Purge(Vec<String>),
    Pause(Vec<String>),
    Resume(Vec<String>),
    Delay(Vec<String>),
    DelayAll,
    ReAdd(Vec<String>),
    Rename { id: String, name: String },
    Bt(String),
    Torrent { hash: String, path: PathBuf },
    Verify { id: String, path: PathBuf },
    Watch,
}

impl Command {
    /// Parses the arguments after the program name. `None` means the
    /// usage text should be shown.
    fn parse(args: &[String]) -> Option<Self> {
        let (name, rest) = args.split_first()?;
        let one = || match rest {
            [arg] => Some(arg.clone()),
            _ => None,
        };
        let some = || (!rest.is_empty()).then(|| rest.to_vec());
        let two = || match rest {
            [a, b] => Some((a.clone(), b.clone())),
            _ => None,
        };

        let command = match name.as_str() {
            "login" => Self::Login,
            "ls" => match rest {
                [] => Self::List(None),
                [query] => Self::List(Some(query.clone())),
                _ => return None,
            },
            "ld" => Self::Deleted,
            "le" => Self::Expired,
            "info" => Self::Info(one()?),
            "add" => Self::Add(some()?),
            "batch" => Self::Batch(some()?),
            "rm" => Self::Remove(some()?),
            "purge" => Self::Purge(some()?),
            "pause" => Self::Pause(some()?),
            "resume" => Self::Resume(some()?),
            "delay" => Self::Delay(some()?),
            "delay-all" => Self::DelayAll,
            "readd" => Self::ReAdd(some()?),
            "rename" => {
                let (id, name) = two()?;
                Self::Rename { id, name }
            }
            "bt" => Self::Bt(one()?),
            "torrent" => {
                let (hash, path) = two()?;
                Self::Torrent {
                    hash,
                    path: PathBuf::from(path),
                }
            }
            "verify" => {
                let (id, path) = two()?;
                Self::Verify {
                    id,
                    path: PathBuf::from(path),
                }
            }
            "watch" => Self::Watch,
            _ => return None,
        };
        Some(command)
    }

    /// Whether the command looks tasks up in the cache.
    const fn needs_tasks(&self) -> bool {
        matches!(
            self,
            Self::Info(_)
                | Self::Remove(_)
                | Self::Purge(_)
                | Self::Pause(_)
                | Self::Resume(_)
                | Self::Delay(_)
                | Self::ReAdd(_)
                | Self::Rename { .. }
                | Self::Bt(_)
                | Self::Verify { .. }
        )
    }

    /// Whether deleted and expired tasks must be cached too.
    const fn needs_history(&self) -> bool {
        matches!(
            self,
            Self::Info(_) | Self::Remove(_) | Self::Purge(_) | Self::ReAdd(_)
        )
    }
}

fn print_usage() {
    eprintln!("Usage: lx <COMMAND> [ARGS]...");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  login                 Log in again and save the session");
    eprintln!("  ls [query]            List tasks, optionally filtered");
    eprintln!("                        (name=<re>&group=<status>&status=<flag>&type=<bt|nbt>)");
    eprintln!("  ld                    List deleted tasks");
    eprintln!("  le                    List expired tasks");
    eprintln!("  info <id>             Show one task");
    eprintln!("  add <uri>...          Submit URLs, magnets, hashes or torrent files");
    eprintln!("  batch <uri>...        Submit several plain URLs at once");
    eprintln!("  rm <id>...            Delete tasks");
    eprintln!("  purge <id>...         Delete tasks permanently");
    eprintln!("  pause <id>...         Pause tasks");
    eprintln!("  resume <id>...        Restart failed or pending tasks");
    eprintln!("  delay <id>...         Extend task lifetimes");
    eprintln!("  delay-all             Extend every task lifetime");
    eprintln!("  readd <id>...         Re-submit deleted or expired tasks");
    eprintln!("  rename <id> <name>    Rename a task");
    eprintln!("  bt <id>               List the files of a BT task");
    eprintln!("  torrent <hash> <file> Save a task's torrent");
    eprintln!("  verify <id> <path>    Check downloaded content against the task");
    eprintln!("  watch                 Follow progress of running tasks");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  LIXIAN_ACCOUNT, LIXIAN_PASSWORD   Credentials when no saved session works");
    eprintln!("  LIXIAN_COOKIE_FILE                Saved session path");
    eprintln!("  RUST_LOG                          Log filter (default: info)");
}

// ============================================================================
// Session Setup
// ============================================================================

fn credentials() -> lixian::Result<(String, String)> {
    let account = env::var("LIXIAN_ACCOUNT").map_err(|_| Error::InvalidAccount)?;
    let password = env::var("LIXIAN_PASSWORD")
        .map_err(|_| Error::Config("LIXIAN_PASSWORD not set".to_string()))?;
    Ok((account, password))
}

async fn open_session(config: &AppConfig, fresh: bool) -> lixian::Result<Session> {
    let session = Session::new(config.client.clone())?;
    let cookie_file = &config.paths.cookie_file;
    if !fresh {
        match session.resume_session(cookie_file).await {
            Ok(()) => return Ok(session),
            Err(e) => info!("saved session not usable: {e}"),
        }
    }
    let (account, password) = credentials()?;
    session.login(&account, &password).await?;
    session.save_session(cookie_file)?;
    info!("session saved to {}", cookie_file.display());
    Ok(session)
}

async fn load_cache(session: &Session, command: &Command) -> lixian::Result<()> {
    if command.needs_tasks() {
        session.get_tasks().await?;
    }
    if command.needs_history() {
        session.get_deleted_tasks().await?;
        session.get_expired_tasks().await?;
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) {
    let mut tasks: Vec<_> = tasks.into_iter().collect();
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    for task in tasks {
        println!("{task}");
    }
}

fn report(id: &str, result: lixian::Result<Task>) {
    match result {
        Ok(task) => println!("{task}"),
        Err(e) => eprintln!("{id}: {e}"),
    }
}

// ============================================================================
// Dispatch
// ============================================================================

#[allow(clippy::too_many_lines)]
async fn run(session: Arc<Session>, command: Command) -> lixian::Result<()> {
    match command {
        Command::Login => println!("logged in as {}", session.uid()),
        Command::List(query) => {
            session.get_tasks().await?;
            let tasks = session.find_tasks(query.as_deref().unwrap_or_default())?;
            print_tasks(tasks.values());
        }
        Command::Deleted => print_tasks(&session.get_deleted_tasks().await?),
        Command::Expired => print_tasks(&session.get_expired_tasks().await?),
        Command::Info(id) => {
            let task = session.task(&id).ok_or_else(|| Error::TaskNotFound(id.clone()))?;
            println!("{}", task.describe());
        }
        Command::Add(sources) => {
            for source in &sources {
                match session.add_task(source).await {
                    Ok(Some(id)) => println!("{source}: task {id}"),
                    Ok(None) => println!("{source}: submitted"),
                    Err(e) => eprintln!("{source}: {e}"),
                }
            }
        }
        Command::Batch(urls) => {
            session.add_batch_tasks(&urls, &[]).await?;
            println!("{} urls submitted", urls.len());
        }
        Command::Remove(ids) => {
            for id in &ids {
                report(id, session.delete_task(id).await);
            }
        }
        Command::Purge(ids) => {
            for id in &ids {
                report(id, session.purge_task(id).await);
            }
        }
        Command::Pause(ids) => {
            session.pause_tasks(&ids).await?;
            println!("{} tasks paused", ids.len());
        }
        Command::Resume(ids) => {
            for id in &ids {
                report(id, session.resume_task(id).await);
            }
        }
        Command::Delay(ids) => {
            for id in &ids {
                report(id, session.delay_task(id).await);
            }
        }
        Command::DelayAll => println!("{}", session.delay_all().await?),
        Command::ReAdd(ids) => {
            let failures = session.re_add_tasks(&ids).await;
            for (id, e) in &failures {
                eprintln!("{id}: {e}");
            }
            println!("{} of {} re-added", ids.len().saturating_sub(failures.len()), ids.len());
        }
        Command::Rename { id, name } => report(&id, session.rename_task(&id, &name).await),
        Command::Bt(id) => {
            let list = session.fill_bt_list(&id).await?;
            println!("{} ({} files)", list.info_id, list.records.len());
            for record in &list.records {
                println!(
                    "{:>4} {} {} {:.1}%",
                    record.id, record.name, record.size_readable, record.percent
                );
            }
        }
        Command::Torrent { hash, path } => {
            session.save_torrent(&hash, &path).await?;
            println!("saved {}", path.display());
        }
        Command::Verify { id, path } => {
            if session.verify_task(&id, &path).await? {
                println!("{id}: ok");
            } else {
                println!("{id}: mismatch");
                std::process::exit(2);
            }
        }
        Command::Watch => watch(&session).await?,
    }
    Ok(())
}

async fn watch(session: &Arc<Session>) -> lixian::Result<()> {
    let running = session.get_incompleted_tasks().await?;
    if running.is_empty() {
        println!("no tasks in progress");
        return Ok(());
    }
    print_tasks(&running);

    let poller = session.spawn_poller(|task: &Task| {
        println!(
            "{} {:.1}% {} {}",
            task.id,
            task.progress,
            format_speed(&task.speed),
            task.display_status()
        );
    });
    poller.trigger();
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {e}");
    }
    poller.shutdown().await;
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> lixian::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        std::process::exit(0);
    }
    let Some(command) = Command::parse(&args) else {
        print_usage();
        std::process::exit(1);
    };

    let config = AppConfig::load()?;
    let session = Arc::new(open_session(&config, command == Command::Login).await?);
    load_cache(&session, &command).await?;
    run(session, command).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(Command::parse(&args("ls")), Some(Command::List(None)));
        assert_eq!(
            Command::parse(&args("ls type=bt")),
            Some(Command::List(Some("type=bt".to_string())))
        );
        assert_eq!(
            Command::parse(&args("rm 1 2")),
            Some(Command::Remove(vec!["1".to_string(), "2".to_string()]))
        );
        assert_eq!(
            Command::parse(&args("rename 7 new.mkv")),
            Some(Command::Rename {
                id: "7".to_string(),
                name: "new.mkv".to_string()
            })
        );
        assert_eq!(Command::parse(&args("delay-all")), Some(Command::DelayAll));
    }

    #[test]
    fn rejects_wrong_arity_and_unknown_commands() {
        assert_eq!(Command::parse(&[]), None);
        assert_eq!(Command::parse(&args("rm")), None);
        assert_eq!(Command::parse(&args("info 1 2")), None);
        assert_eq!(Command::parse(&args("verify 1")), None);
        assert_eq!(Command::parse(&args("frobnicate")), None);
    }

    #[test]
    fn history_is_loaded_only_where_needed() {
        assert!(Command::ReAdd(vec![]).needs_history());
        assert!(Command::Pause(vec![]).needs_tasks());
        assert!(!Command::Pause(vec![]).needs_history());
        assert!(!Command::Watch.needs_tasks());
    }
}
