use std::path::Path;

/// How the interactive shell is started inside a sandbox.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Shell binary, resolved inside the sandbox.
    pub shell: String,
    pub args: Vec<String>,
    /// Value of `TERM` for the shell.
    pub term: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: resolve_default_shell(),
            args: Vec::new(),
            term: "xterm-256color".to_string(),
        }
    }
}

impl ShellConfig {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            ..Default::default()
        }
    }
}

pub fn resolve_default_shell() -> String {
    if let Ok(shell_env) = std::env::var("SHELL") {
        if !shell_env.is_empty() && Path::new(&shell_env).exists() {
            return shell_env;
        }
    }

    for candidate in ["/bin/bash", "/usr/bin/bash", "/bin/sh", "/usr/bin/sh"] {
        if Path::new(candidate).exists() {
            return candidate.to_string();
        }
    }

    "/bin/sh".to_string()
}
