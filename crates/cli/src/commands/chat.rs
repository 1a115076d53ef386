//! `toolrelay chat`: Interactive or single-message chat mode.

use std::io::Write;
use toolrelay_agent::{SessionId, SessionManager, SessionSettings, SessionStats};
use toolrelay_core::message::{Role, Turn};
use toolrelay_telemetry::ConversationFlow;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::build_runtime;

/// One line of user input, interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Message(String),
    Empty,
    Exit,
    Help,
    History,
    Flows,
    Stats,
    Clear,
    Sessions,
    New(Option<String>),
    Rename(String),
    Unknown(String),
}

pub fn parse_input(line: &str) -> ChatInput {
    let line = line.trim();
    if line.is_empty() {
        return ChatInput::Empty;
    }
    if matches!(line, "exit" | "quit") {
        return ChatInput::Exit;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ChatInput::Message(line.to_string());
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (command, None),
    };

    match (name, arg) {
        ("exit" | "quit", _) => ChatInput::Exit,
        ("help", _) => ChatInput::Help,
        ("history", _) => ChatInput::History,
        ("flows", _) => ChatInput::Flows,
        ("stats", _) => ChatInput::Stats,
        ("clear", _) => ChatInput::Clear,
        ("sessions", _) => ChatInput::Sessions,
        ("new", arg) => ChatInput::New(arg.map(String::from)),
        ("rename", Some(arg)) => ChatInput::Rename(arg.to_string()),
        _ => ChatInput::Unknown(line.to_string()),
    }
}

pub async fn run(message: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = build_runtime()?;
    let settings = SessionSettings::from_config(&runtime.config, runtime.model.clone());
    let manager = SessionManager::new(
        runtime.provider,
        runtime.catalog.clone(),
        runtime.debug,
        settings,
    );
    let mut current = manager.create_session("Session 1")?;

    if let Some(msg) = message {
        // Single message mode
        eprint!("  Thinking...");
        let result = manager.process_message(&current, &msg).await;
        eprint!("\r              \r");
        println!("{}", result?);
        return Ok(());
    }

    // Interactive mode
    println!();
    println!("  toolrelay — interactive chat");
    println!();
    println!("  Provider:  {}", runtime.config.default_provider);
    println!("  Model:     {}", runtime.model);
    println!("  Tools:     {}", runtime.catalog.names().join(", "));
    println!();
    println!("  Type your message and press Enter. /help lists commands.");
    println!("  Ctrl+C interrupts a running reply; 'exit' quits.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;

    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            ChatInput::Empty => {}
            ChatInput::Exit => break,
            ChatInput::Help => print_help(),
            ChatInput::Message(text) => respond(&manager, &current, &text).await?,
            ChatInput::History => print!("{}", render_history(&manager.history(&current).await?)),
            ChatInput::Flows => print!("{}", render_flows(&manager.flows(&current)?)),
            ChatInput::Stats => print!("{}", render_stats(&manager.stats())),
            ChatInput::Clear => {
                manager.clear_history(&current).await?;
                println!("  History cleared.");
            }
            ChatInput::Sessions => {
                for info in manager.list_sessions() {
                    let marker = if info.id == current { "*" } else { " " };
                    println!(
                        "  {marker} {} [{:?}] {} messages, {} errors",
                        info.name, info.status, info.message_count, info.error_count
                    );
                }
            }
            ChatInput::New(name) => {
                let name = name.unwrap_or_else(|| {
                    format!("Session {}", manager.list_sessions().len() + 1)
                });
                match manager.create_session(name.clone()) {
                    Ok(id) => {
                        current = id;
                        println!("  Switched to new session '{name}'.");
                    }
                    Err(e) => eprintln!("  [Error] {e}"),
                }
            }
            ChatInput::Rename(name) => {
                manager.rename(&current, name.clone())?;
                println!("  Session renamed to '{name}'.");
            }
            ChatInput::Unknown(input) => eprintln!("  Unknown command: {input} (try /help)"),
        }
        prompt()?;
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

fn prompt() -> std::io::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()
}

/// Send one message, letting Ctrl+C stop the session's in-flight work.
async fn respond(
    manager: &SessionManager,
    session: &SessionId,
    text: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    eprint!("  ...");
    let work = manager.process_message(session, text);
    tokio::pin!(work);

    let result = tokio::select! {
        result = &mut work => result,
        _ = tokio::signal::ctrl_c() => {
            manager.interrupt(session)?;
            work.await
        }
    };
    eprint!("\r     \r");

    match result {
        Ok(reply) => {
            println!();
            for line in reply.lines() {
                println!("  Assistant > {line}");
            }
            println!();
        }
        Err(e) => {
            eprintln!("  [Error] {e}");
            println!();
        }
    }
    Ok(())
}

fn print_help() {
    println!("  /history        show this session's turns");
    println!("  /flows          show debug flows for this session");
    println!("  /stats          event, token and session totals");
    println!("  /clear          forget this session's turns");
    println!("  /sessions       list sessions");
    println!("  /new [name]     start and switch to a new session");
    println!("  /rename <name>  rename this session");
    println!("  /exit           quit");
}

fn render_history(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns {
        let label = match turn.role {
            Role::System => "system",
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        if turn.has_tool_calls() {
            for call in &turn.tool_calls {
                out.push_str(&format!(
                    "  [{label}] calls {}({})\n",
                    call.tool_name, call.raw_arguments
                ));
            }
        }
        if let Some(content) = turn.content.as_deref().filter(|c| !c.is_empty()) {
            let name = turn.tool_name.as_deref().map(|n| format!(" {n}")).unwrap_or_default();
            out.push_str(&format!("  [{label}{name}] {content}\n"));
        }
    }
    out
}

fn render_flows(flows: &[ConversationFlow]) -> String {
    if flows.is_empty() {
        return "  No flows recorded yet.\n".into();
    }
    let mut out = String::new();
    for flow in flows {
        let status = if flow.is_complete {
            "complete"
        } else if flow.is_sealed() {
            "incomplete"
        } else {
            "open"
        };
        let usage = flow.token_usage();
        out.push_str(&format!(
            "  {} '{}' {status}, {} events, {} ms, {} tokens\n",
            flow.timestamp.format("%H:%M:%S"),
            flow.user_message,
            flow.events.len(),
            flow.total_duration_ms.unwrap_or(0),
            usage.total_tokens
        ));
    }
    out
}

fn render_stats(stats: &SessionStats) -> String {
    let mut out = format!(
        "  Sessions: {} ({} active), {} messages, {} errors\n",
        stats.total_sessions, stats.active_sessions, stats.total_messages, stats.total_errors
    );
    out.push_str(&format!(
        "  Events:   {} total, {} retained\n",
        stats.debug.total_events, stats.debug.retained_events
    ));
    for (kind, count) in &stats.debug.events_by_kind {
        out.push_str(&format!("    {kind}: {count}\n"));
    }
    out.push_str(&format!(
        "  Flows:    {} started, {} completed, {} abandoned\n",
        stats.debug.flows_started, stats.debug.flows_completed, stats.debug.flows_abandoned
    ));
    out.push_str(&format!(
        "  Tokens:   {} prompt + {} completion = {} total\n",
        stats.debug.tokens.prompt_tokens,
        stats.debug.tokens.completion_tokens,
        stats.debug.tokens.total_tokens
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            parse_input("  what is 2+2? "),
            ChatInput::Message("what is 2+2?".into())
        );
        assert_eq!(parse_input("   "), ChatInput::Empty);
        assert_eq!(parse_input("exit"), ChatInput::Exit);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(parse_input("/history"), ChatInput::History);
        assert_eq!(parse_input("/flows"), ChatInput::Flows);
        assert_eq!(parse_input("/stats"), ChatInput::Stats);
        assert_eq!(parse_input("/clear"), ChatInput::Clear);
        assert_eq!(parse_input("/sessions"), ChatInput::Sessions);
        assert_eq!(parse_input("/new"), ChatInput::New(None));
        assert_eq!(parse_input("/new scratch"), ChatInput::New(Some("scratch".into())));
        assert_eq!(parse_input("/rename  math help "), ChatInput::Rename("math help".into()));
    }

    #[test]
    fn rename_needs_a_name() {
        assert_eq!(parse_input("/rename"), ChatInput::Unknown("/rename".into()));
        assert_eq!(parse_input("/bogus"), ChatInput::Unknown("/bogus".into()));
    }

    #[test]
    fn history_shows_tool_calls_and_results() {
        let call = toolrelay_core::message::ToolCallRequest::new(
            "c1",
            "calculator",
            r#"{"expression":"1+1"}"#,
        );
        let turns = vec![
            Turn::user("1+1?"),
            Turn::assistant_tool_calls(None, vec![call]),
            Turn::tool_result("c1", "calculator", "2"),
            Turn::assistant("It is 2."),
        ];
        let out = render_history(&turns);
        assert!(out.contains("[you] 1+1?"));
        assert!(out.contains(r#"calls calculator({"expression":"1+1"})"#));
        assert!(out.contains("[tool calculator] 2"));
        assert!(out.contains("[assistant] It is 2."));
    }
}
