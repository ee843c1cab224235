use anyhow::Result;
use cadence::prelude::*;
use cadence::{ENGINE_NAME, VERSION as LIB_VERSION};
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

const COMMANDS: &[&str] = &[
    "add", "once", "remove", "list", "stats", "clear", "shutdown", "watch", "help", "exit",
];

/// Colors the command word by whether the shell knows it; arguments stay plain.
#[derive(Completer, Helper, Hinter, Validator)]
struct CommandHighlighter;

impl Highlighter for CommandHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        let paint = |verb: &str| {
            if COMMANDS.contains(&verb) {
                verb.green().bold()
            } else {
                verb.red()
            }
        };
        match line.split_once(' ') {
            Some((verb, args)) => Cow::Owned(format!("{} {}", paint(verb), args)),
            None if line.is_empty() => Cow::Borrowed(line),
            None => Cow::Owned(paint(line).to_string()),
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    println!("{}", format!("  {} :: plans on threads", ENGINE_NAME.to_lowercase()).cyan().bold());

    let version_string = format!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    let rule = "-".repeat(72);
    let license_blurb = "
    This software is provided 'as is', without warranty of any kind.
    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.
    ";

    println!("{}", rule.dimmed());
    println!("{}", version_string);
    println!("{}", license_blurb.dimmed());
    println!("{}", rule.dimmed());
}

/// Prints registry events, and plan runs while `watching` is set.
fn spawn_event_listener(timer: &ListTimer, watching: Arc<AtomicBool>) {
    let mut events = timer.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TimerEvent::PlanRan { .. } => {}
                TimerEvent::PlanFinished {
                    name,
                    finished_count,
                    failure,
                    ..
                } => {
                    if watching.load(Ordering::Relaxed) {
                        match failure {
                            Some(failure) => println!(
                                "<-- [RUN] {} #{} {}",
                                name,
                                finished_count,
                                failure.red()
                            ),
                            None => println!("<-- [RUN] {} #{} ok", name, finished_count),
                        }
                    }
                }
                other => println!("\n<-- [TIMER EVENT] {:?}\n>> ", other),
            }
        }
    });
}

fn parse_millis(arg: Option<&&str>) -> Option<Duration> {
    arg.and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn format_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|at| at.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Schedules `plan` under `name`, refusing names that are still live.
fn register(
    timer: &ListTimer,
    plans: &mut BTreeMap<String, Arc<Plan>>,
    name: &str,
    plan: Plan,
) {
    if let Some(existing) = plans.get(name) {
        if timer.contains(existing) {
            println!("Error: a plan named '{}' is already scheduled.", name);
            return;
        }
    }
    let plan = Arc::new(plan);
    match timer.schedule(&plan) {
        Ok(_) => {
            plans.insert(name.to_string(), plan);
            println!("--> Scheduled plan '{}'.", name);
        }
        Err(err) => println!("Error: {}", err),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = CadenceConfig::load("cadence.toml")?;
    let timer = ListTimer::new(config.timer);

    // Create the shared flag for the run listener.
    let watching = Arc::new(AtomicBool::new(false));
    spawn_event_listener(&timer, watching.clone());

    // The shell's state: plans by the name they were added under.
    let mut plans: BTreeMap<String, Arc<Plan>> = BTreeMap::new();

    let mut rl = Editor::new()?;
    rl.set_helper(Some(CommandHighlighter));

    println!("{} is running. Type 'help' for commands or 'exit' to quit.", ENGINE_NAME.cyan());

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        let readline = rl.readline(&prompt);
        match readline {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();

                if let Some(command) = args.first() {
                    match *command {
                        "add" => {
                            if let (Some(name), Some(period)) = (args.get(1), parse_millis(args.get(2))) {
                                let name = name.to_string();
                                match Plan::fixed_period(name.clone(), period, || Ok(())) {
                                    Ok(plan) => register(&timer, &mut plans, &name, plan),
                                    Err(err) => println!("Error: {}", err),
                                }
                            } else {
                                println!("Usage: add <NAME> <PERIOD_MS>");
                            }
                        }
                        "once" => {
                            if let (Some(name), Some(delay)) = (args.get(1), parse_millis(args.get(2))) {
                                let plan = Plan::once(name.to_string(), || Ok(())).with_offset(delay);
                                register(&timer, &mut plans, name, plan);
                            } else {
                                println!("Usage: once <NAME> <DELAY_MS>");
                            }
                        }
                        "remove" => {
                            if let Some(name) = args.get(1) {
                                if let Some(plan) = plans.remove(*name) {
                                    if timer.remove(&plan) {
                                        println!("--> Plan '{}' removed.", name);
                                    } else {
                                        println!("--> Plan '{}' had already left the timer.", name);
                                    }
                                } else {
                                    println!("Error: no plan named '{}'. Use 'list' to see plans.", name);
                                }
                            } else {
                                println!("Usage: remove <NAME>");
                            }
                        }
                        "list" => {
                            println!("Scheduled Plans ({}):", timer.len());
                            for (name, plan) in &plans {
                                if let Some(key) = timer.key_of(plan) {
                                    println!("  {:<16} {:?} {:?}", name, key, plan.policy());
                                }
                            }
                        }
                        "stats" => {
                            for plan in plans.values() {
                                let stats = plan.stats();
                                println!(
                                    "  {:<16} {:?} runs={} failing={} last={} next={}{}",
                                    stats.name,
                                    stats.state,
                                    stats.finished_count,
                                    stats.last_failure_count,
                                    format_time(stats.actual_run_time),
                                    format_time(stats.expected_run_time),
                                    if stats.exhausted { " (done)" } else { "" }
                                );
                            }
                            println!(
                                "  drivers={} shutdown={} terminated={}",
                                timer.live_drivers(),
                                timer.is_shutdown(),
                                timer.is_terminated()
                            );
                        }
                        "clear" => {
                            timer.clear();
                            plans.clear();
                            println!("--> All plans removed.");
                        }
                        "shutdown" => {
                            timer.shutdown();
                            println!("--> Timer no longer accepts plans.");
                        }
                        "watch" => match args.get(1) {
                            Some(&"on") => {
                                watching.store(true, Ordering::Relaxed);
                                println!("--> Watching plan runs.");
                            }
                            Some(&"off") => {
                                watching.store(false, Ordering::Relaxed);
                                println!("--> Stopped watching plan runs.");
                            }
                            _ => println!("Usage: watch on|off"),
                        },
                        "help" => {
                            println!("Available commands:");
                            println!("  add <N> <MS>          - Schedules plan N every MS milliseconds.");
                            println!("  once <N> <MS>         - Schedules plan N to run once after MS milliseconds.");
                            println!("  remove <N>            - Removes plan N from the timer.");
                            println!("  list                  - Shows scheduled plans.");
                            println!("  stats                 - Shows run counters for every plan.");
                            println!("  clear                 - Removes every plan.");
                            println!("  shutdown              - Stops the timer from accepting plans.");
                            println!("  watch on|off          - Prints each finished run.");
                            println!("  exit                  - Quits the shell.");
                        }
                        "exit" => break,
                        _ => println!("Unknown command: '{}'. Type 'help'.", line),
                    }
                }
            }
            Err(_) => break,
        }
    }

    println!("Exiting {}-shell...", ENGINE_NAME.to_lowercase());
    timer.terminate();
    let waiter = timer.clone();
    let terminated = tokio::task::spawn_blocking(move || {
        waiter.await_termination_timeout(Duration::from_secs(5))
    })
    .await?;
    info!("Timer terminated: {}", terminated);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_words_are_colored_by_whether_they_exist() {
        colored::control::set_override(true);
        let highlighter = CommandHighlighter;

        assert_eq!(
            highlighter.highlight("add heartbeat 500", 0),
            format!("{} heartbeat 500", "add".green().bold())
        );
        assert_eq!(highlighter.highlight("stats", 0), "stats".green().bold().to_string());
        assert_eq!(highlighter.highlight("launch now", 0), format!("{} now", "launch".red()));
        assert!(matches!(highlighter.highlight("", 0), Cow::Borrowed("")));
    }
}
