use std::io::{self, BufRead, Write};
use std::sync::Arc;

use uuid::Uuid;

use opsbot_agent::runtime::Pipeline;
use opsbot_core::config::{AppConfig, LoadOptions};
use opsbot_core::context::SessionStore;
use opsbot_core::{SessionId, UserId};
use opsbot_db::{connect, migrations, SqlSessionStore};

use crate::commands::CommandResult;
use crate::init_logging;

pub fn run(session: Option<String>, persist: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    init_logging(&config);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let session_id = SessionId(session.unwrap_or_else(|| Uuid::new_v4().to_string()));

    let result = runtime.block_on(async {
        let store: Arc<dyn SessionStore> = if persist {
            let pool = connect(&config.database)
                .await
                .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
            migrations::run_pending(&pool)
                .await
                .map_err(|error| ("migration", error.to_string(), 5u8))?;
            Arc::new(SqlSessionStore::new(pool))
        } else {
            Arc::new(opsbot_agent::InMemorySessionStore::new())
        };

        let pipeline = Pipeline::demo_with_store(&config, store)
            .map_err(|error| ("pipeline_init", error.to_string(), 6u8))?;

        let user_id = UserId("operator".to_string());
        println!("opsbot demo backend ready (session {session_id}). Type 'exit' to leave.");

        converse(&pipeline, &session_id, &user_id)
            .await
            .map_err(|error| ("io", error.to_string(), 7u8))?;
        Ok::<(), (&'static str, String, u8)>(())
    });

    match result {
        Ok(()) => CommandResult::success_with_details(
            "chat",
            "conversation ended",
            serde_json::json!({"session": session_id.0}),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("chat", error_class, message, exit_code)
        }
    }
}

async fn converse(
    pipeline: &Pipeline,
    session_id: &SessionId,
    user_id: &UserId,
) -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "you> ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if matches!(line, "exit" | "quit") {
            break;
        }

        match pipeline.process(line, session_id, user_id).await {
            Ok(output) => writeln!(stdout, "opsbot> {}", output.response)?,
            Err(error) => writeln!(stdout, "opsbot> internal error: {error}")?,
        }
    }
    Ok(())
}
