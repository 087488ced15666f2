use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use companion_core::remote::{broadcast, fan_out, ChatMessage, HostedChatClient};
use companion_core::{CompanionConfig, MemoryContext, ModelProvisioner, ResponseEngine};

const API_KEY_VAR: &str = "OPENAI_API_KEY";

enum Command<'a> {
    Quit,
    Clear,
    Persona(&'a str),
    Remember { label: &'a str, fact: &'a str },
    Forget(Option<&'a str>),
    Compare(&'a str),
    Turn(&'a str),
}

fn parse_command(line: &str) -> Result<Command<'_>, String> {
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Turn(line));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    match name {
        "quit" | "exit" => Ok(Command::Quit),
        "clear" => Ok(Command::Clear),
        "persona" if !arg.is_empty() => Ok(Command::Persona(arg)),
        "persona" => Err("usage: /persona <text>".to_string()),
        "remember" => match arg.split_once('=') {
            Some((label, fact)) if !label.trim().is_empty() => Ok(Command::Remember {
                label: label.trim(),
                fact: fact.trim(),
            }),
            _ => Err("usage: /remember <label>=<fact>".to_string()),
        },
        "compare" if !arg.is_empty() => Ok(Command::Compare(arg)),
        "compare" => Err("usage: /compare <text>".to_string()),
        "forget" => Ok(Command::Forget((!arg.is_empty()).then_some(arg))),
        other => Err(format!("unknown command /{}", other)),
    }
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => CompanionConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => CompanionConfig::default(),
    };
    init_logging(&config.logging.filter);

    let provisioner = ModelProvisioner::from_config(&config);
    info!(
        model = %config.model.id,
        device = provisioner.device().name(),
        "starting companion"
    );
    let mut engine = ResponseEngine::new(provisioner, config.engine.persona.clone(), config.engine.options())?;

    let remote = std::env::var(API_KEY_VAR)
        .ok()
        .map(|key| HostedChatClient::from_settings(&config.remote, key));

    let mut memory = MemoryContext::new();
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    print!("> ");
    stdout.flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            print!("> ");
            stdout.flush()?;
            continue;
        }

        match parse_command(line) {
            Ok(Command::Quit) => break,
            Ok(Command::Clear) => {
                engine.clear_cache();
                println!("(cache cleared)");
            }
            Ok(Command::Persona(persona)) => {
                engine.update_persona(persona);
                println!("(persona updated)");
            }
            Ok(Command::Remember { label, fact }) => {
                memory.insert(label, fact);
                println!("(remembered {})", label);
            }
            Ok(Command::Forget(Some(label))) => {
                if memory.remove(label).is_none() {
                    println!("(nothing remembered as {})", label);
                }
            }
            Ok(Command::Forget(None)) => memory.clear(),
            Ok(Command::Compare(input)) => match &remote {
                Some(client) => {
                    let messages = [ChatMessage::system(engine.persona()), ChatMessage::user(input)];
                    let conversations = broadcast(&config.remote.models, &messages);
                    match fan_out(client, &config.remote.models, &conversations) {
                        Ok(replies) => {
                            for (alias, text) in replies {
                                println!("[{}] {}", alias, text);
                            }
                        }
                        Err(e) => warn!(error = %e, "hosted comparison failed"),
                    }
                }
                None => warn!("/compare needs {} in the environment", API_KEY_VAR),
            },
            Ok(Command::Turn(input)) => {
                let context = (!memory.is_empty()).then_some(&memory);
                println!("{}", engine.generate_response(input, context));
            }
            Err(usage) => warn!("{}", usage),
        }
        print!("> ");
        stdout.flush()?;
    }

    Ok(())
}
