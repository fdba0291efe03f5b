//! `railhead completions <shell>`.
//!
//! Supported shells are the ones `clap_complete` knows: bash, elvish, fish,
//! powershell and zsh. Install the script where the shell looks for it, e.g.
//! `railhead completions bash > ~/.local/share/bash-completion/completions/railhead`.

use super::EXIT_SUCCESS;
use clap::CommandFactory;
use clap_complete::Shell;
use std::io::Write;

/// Completion script for `C` in `shell`, under the command's own name.
pub fn script<C: CommandFactory>(shell: Shell) -> Vec<u8> {
    let mut cmd = C::command();
    let name = cmd.get_name().to_owned();
    let mut out = Vec::new();
    clap_complete::generate(shell, &mut cmd, name, &mut out);
    out
}

pub fn run<C: CommandFactory>(shell: Shell) -> Result<u8, String> {
    std::io::stdout()
        .lock()
        .write_all(&script::<C>(shell))
        .map_err(|e| format!("failed to write {shell} completions: {e}"))?;
    Ok(EXIT_SUCCESS)
}
