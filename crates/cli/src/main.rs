use std::process::ExitCode;

fn main() -> ExitCode {
    opsbot_cli::run()
}
