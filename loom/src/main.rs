//! Interactive worldline reader.
//!
//! A line-oriented protocol over a [`StorySession`]:
//! - Lines starting with `#` are commands (#load, #next, #edit, ...)
//! - All other output is chapter text or engine state
//!
//! ```bash
//! cargo run -p loom -- --protagonist Subaru --root worldline
//! ```

use loom_core::{Branch, SessionConfig, StorySession};
use oracle::Oracle;
use std::io::{self, BufRead, Write};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(io::stderr)
        .init();

    if std::env::var("OPENAI_API_KEY").is_err() {
        eprintln!("Error: OPENAI_API_KEY environment variable not set.");
        eprintln!("Please set it in .env or with: export OPENAI_API_KEY=your_key_here");
        std::process::exit(1);
    }

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let protagonist = arg_value(&args, "--protagonist").unwrap_or_else(|| "Subaru".to_string());
    let root = arg_value(&args, "--root").unwrap_or_else(|| "worldline".to_string());
    let mut generator = Oracle::from_env()?;
    if let Some(model) = arg_value(&args, "--model") {
        generator = generator.with_model(model);
    }
    if let Some(base_url) = arg_value(&args, "--base-url") {
        generator = generator.with_base_url(base_url);
    }

    let config = SessionConfig::new(protagonist, root);
    let mut session = StorySession::open(generator, config).await?;

    println!("=== Worldline Reader ===");
    print_help();
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('#') {
            println!("[ERROR] Commands start with '#'. Type #help for help.");
            continue;
        }

        let (command, rest) = match line[1..].split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (&line[1..], ""),
        };

        match command {
            "quit" | "exit" => {
                println!("Goodbye!");
                break;
            }
            "help" => print_help(),
            "load" => {
                let mut parts = rest.splitn(2, ' ');
                match (
                    parts.next().and_then(|s| s.parse::<u32>().ok()),
                    parts.next(),
                ) {
                    (Some(chapter_id), Some(path)) => match std::fs::read_to_string(path) {
                        Ok(text) => {
                            session.load_chapter(chapter_id, &text);
                            println!("[LOADED] chapter {chapter_id} from {path}");
                        }
                        Err(e) => println!("[ERROR] Could not read {path}: {e}"),
                    },
                    _ => println!("[ERROR] Usage: #load <chapter_id> <path>"),
                }
            }
            "next" => match session.next() {
                Ok(chunk) => {
                    println!("{chunk}");
                    println!();
                }
                Err(e) => println!("[ERROR] {e}"),
            },
            "edit" => {
                let Some((marker, replacement)) = rest.split_once('|') else {
                    println!("[ERROR] Usage: #edit <marker text> | <replacement line>");
                    continue;
                };
                let Some(chapter_id) = session.playback().map(|p| p.session().chapter_id) else {
                    println!("[ERROR] No chapter loaded. Use #load first.");
                    continue;
                };
                print!("[REWRITING]");
                stdout.flush().ok();
                match session
                    .accept_edit(chapter_id, marker.trim(), replacement.trim())
                    .await
                {
                    Ok(outcome) => {
                        print!("\r           \r");
                        for warning in &outcome.warnings {
                            println!("[WARN] {warning}");
                        }
                        for (event, verdict) in &outcome.report.flagged {
                            println!(
                                "[FLAG] {} {} (score {:.2})",
                                event.who, event.action, verdict.score
                            );
                        }
                        println!(
                            "[COMMITTED] {} to {} (commit {})",
                            outcome.report.receipt.chapter_id,
                            outcome.report.receipt.branch,
                            outcome.report.receipt.commit_id
                        );
                    }
                    Err(e) => {
                        print!("\r           \r");
                        println!("[ERROR] {e}");
                    }
                }
            }
            "commit" => {
                print!("[EXTRACTING]");
                stdout.flush().ok();
                match session.commit_chapter().await {
                    Ok(report) => {
                        print!("\r            \r");
                        println!(
                            "[COMMITTED] chapter {} to {} (commit {})",
                            report.receipt.chapter_id, report.receipt.branch, report.receipt.commit_id
                        );
                        for (event, verdict) in &report.flagged {
                            println!(
                                "[FLAG] {} {} (score {:.2})",
                                event.who, event.action, verdict.score
                            );
                        }
                    }
                    Err(e) => {
                        print!("\r            \r");
                        println!("[ERROR] {e}");
                    }
                }
            }
            "state" | "tkg" | "graph" => match parse_branch_chapter(rest) {
                Some((branch, chapter_id)) => {
                    show_store(&session, command, branch, chapter_id).await;
                }
                None => println!("[ERROR] Usage: #{command} <canon|user_branch> <chapter_id>"),
            },
            "diff" => match rest.parse::<u32>() {
                Ok(chapter_id) => match session.diff(chapter_id).await {
                    Ok(diff) if diff.is_empty() => println!("[DIFF] timelines match"),
                    Ok(diff) => {
                        for event in &diff.added_events {
                            println!("[DIFF] + {} {}", event.who, event.action);
                        }
                        for event in &diff.removed_events {
                            println!("[DIFF] - {} {}", event.who, event.action);
                        }
                        for change in &diff.relation_changes {
                            println!(
                                "[DIFF] ~ {} / {}: {:?} -> {:?}",
                                change.a, change.b, change.before, change.after
                            );
                        }
                    }
                    Err(e) => println!("[ERROR] {e}"),
                },
                Err(_) => println!("[ERROR] Usage: #diff <chapter_id>"),
            },
            "reset" => match session.reset_chapter() {
                Ok(()) => println!("[RESET] chapter baseline restored"),
                Err(e) => println!("[ERROR] {e}"),
            },
            _ => println!("[ERROR] Unknown command. Type #help for help."),
        }
        stdout.flush().ok();
    }

    Ok(())
}

async fn show_store(
    session: &StorySession<Oracle>,
    what: &str,
    branch: Branch,
    chapter_id: u32,
) {
    match what {
        "state" => match session.chapter_state(branch, chapter_id).await {
            Ok(state) => {
                println!("[STATE] {} ({} events)", state.title, state.events.len());
                for event in &state.events {
                    println!(
                        "  {} {} {}",
                        event.who,
                        event.action,
                        event.target.as_deref().unwrap_or("")
                    );
                }
                for (object, status) in &state.objects {
                    println!("  [{object}] {status}");
                }
            }
            Err(e) => println!("[ERROR] {e}"),
        },
        "tkg" => match session.chapter_facts(branch, chapter_id) {
            Ok(facts) => {
                for fact in facts {
                    println!(
                        "  #{} {} --{}--> {} ({})",
                        fact.seq, fact.head, fact.relation, fact.tail, fact.meta.evidence
                    );
                }
            }
            Err(e) => println!("[ERROR] {e}"),
        },
        "graph" => match session.chapter_graph(branch, chapter_id).await {
            Ok(graph) => {
                for (name, attrs) in &graph.characters {
                    println!("  {name}: combat {}", attrs.combat_power);
                }
                for edge in &graph.edges {
                    println!(
                        "  {} / {}: {} ({:.2})",
                        edge.a, edge.b, edge.kind, edge.score
                    );
                }
            }
            Err(e) => println!("[ERROR] {e}"),
        },
        _ => unreachable!(),
    }
}

fn parse_branch_chapter(rest: &str) -> Option<(Branch, u32)> {
    let mut parts = rest.split_whitespace();
    let branch = match parts.next()? {
        "canon" => Branch::Original,
        "user_branch" => Branch::Derivative,
        _ => return None,
    };
    let chapter_id = parts.next()?.parse().ok()?;
    Some((branch, chapter_id))
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn print_help() {
    println!("Commands:");
    println!("  #load <id> <path>              - Load a chapter script");
    println!("  #next                          - Reveal the next chunk");
    println!("  #edit <marker> | <replacement> - Rewrite the current protagonist line");
    println!("  #commit                        - Extract and commit the chapter");
    println!("  #state <branch> <id>           - Show a committed chapter state");
    println!("  #tkg <branch> <id>             - Show a committed fact log");
    println!("  #graph <branch> <id>           - Show a committed character graph");
    println!("  #diff <id>                     - Diff canon against user_branch");
    println!("  #reset                         - Restore the chapter baseline");
    println!("  #quit                          - Exit");
    println!("  (branches are 'canon' and 'user_branch')");
}
