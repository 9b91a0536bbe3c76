use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use livesift_source::{Entity, QueryMode, Source, SourceError, UnavailableCause};
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

/// A program and its arguments, split like a shell would but never run
/// through one. Arguments may contain `{id}` and `{name}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Returns `None` for empty input or unbalanced quotes.
    pub fn parse(line: &str) -> Option<Self> {
        let mut argv = shlex::split(line)?.into_iter();
        let program = argv.next()?;
        Some(Self {
            program,
            args: argv.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, entity: Option<&Entity>) -> Command {
        let mut command = Command::new(&self.program);
        match entity {
            Some(entity) => command.args(self.args.iter().map(|arg| expand(arg, entity))),
            None => command.args(&self.args),
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

fn expand(arg: &str, entity: &Entity) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        if let Some(after) = tail.strip_prefix("{id}") {
            out.push_str(&entity.id);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{name}") {
            out.push_str(&entity.display_name);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// A source backed by external commands: one to enumerate, optional ones
/// to rescan first, and optional ones to activate or deactivate an entity.
#[derive(Debug, Clone)]
pub struct CommandSource {
    name: String,
    icon: Option<String>,
    list: CommandLine,
    discover: Vec<CommandLine>,
    activate: Option<CommandLine>,
    deactivate: Option<CommandLine>,
    activate_label: Option<String>,
    deactivate_label: Option<String>,
    timeout: Duration,
    discover_timeout: Duration,
}

impl CommandSource {
    pub fn new(name: impl Into<String>, list: CommandLine) -> Self {
        Self {
            name: name.into(),
            icon: None,
            list,
            discover: Vec::new(),
            activate: None,
            deactivate: None,
            activate_label: None,
            deactivate_label: None,
            timeout: DEFAULT_TIMEOUT,
            discover_timeout: DEFAULT_DISCOVER_TIMEOUT,
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Commands run in order for [`QueryMode::Discover`]; the last one's
    /// output is the listing.
    pub fn with_discover(mut self, steps: Vec<CommandLine>) -> Self {
        self.discover = steps;
        self
    }

    pub fn with_activate(mut self, command: CommandLine, label: Option<String>) -> Self {
        self.activate = Some(command);
        self.activate_label = label;
        self
    }

    /// Used instead of the activate command when the entity is already active.
    pub fn with_deactivate(mut self, command: CommandLine, label: Option<String>) -> Self {
        self.deactivate = Some(command);
        self.deactivate_label = label;
        self
    }

    pub fn with_timeouts(mut self, timeout: Duration, discover_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.discover_timeout = discover_timeout;
        self
    }

    fn toggles_off(&self, entity: &Entity) -> bool {
        entity.state.is_active() && self.deactivate.is_some()
    }

    async fn run(
        &self,
        line: &CommandLine,
        entity: Option<&Entity>,
        timeout: Duration,
    ) -> Result<String, UnavailableCause> {
        debug!(source = %self.name, program = line.program(), "running command");
        let child = line.command(entity).spawn().map_err(|err| match err.kind() {
            ErrorKind::NotFound => UnavailableCause::NotFound,
            _ => UnavailableCause::Io(err.to_string()),
        })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| UnavailableCause::Timeout(timeout))?
            .map_err(|err| UnavailableCause::Io(err.to_string()))?;

        if !output.status.success() {
            return Err(UnavailableCause::ExitStatus {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Source for CommandSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn icon(&self) -> Option<&str> {
        self.icon.as_deref()
    }

    fn describe(&self, entity: &Entity) -> Option<String> {
        let label = match (self.toggles_off(entity), &self.activate) {
            (true, _) => self.deactivate_label.as_deref(),
            (false, Some(_)) => self.activate_label.as_deref(),
            (false, None) => None,
        };
        label.map(|label| label.replace("{name}", &entity.display_name))
    }

    async fn fetch(&self, mode: QueryMode) -> Result<Vec<String>, SourceError> {
        let (steps, timeout) = match mode {
            QueryMode::Discover if !self.discover.is_empty() => {
                (self.discover.as_slice(), self.discover_timeout)
            }
            QueryMode::Known | QueryMode::Discover => {
                (std::slice::from_ref(&self.list), self.timeout)
            }
        };

        let mut stdout = String::new();
        for step in steps {
            stdout = self
                .run(step, None, timeout)
                .await
                .map_err(|cause| SourceError::AdapterUnavailable {
                    adapter: self.name.clone(),
                    cause,
                })?;
        }
        Ok(stdout.lines().map(str::to_owned).collect())
    }

    async fn activate(&self, entity: &Entity) -> Result<(), SourceError> {
        let line = if self.toggles_off(entity) {
            self.deactivate.as_ref()
        } else {
            self.activate.as_ref()
        };
        let line = line.ok_or_else(|| SourceError::ActivationFailed {
            id: entity.id.clone(),
            reason: "no activation command configured".into(),
        })?;

        self.run(line, Some(entity), self.timeout)
            .await
            .map(drop)
            .map_err(|cause| SourceError::ActivationFailed {
                id: entity.id.clone(),
                reason: cause.to_string(),
            })
    }
}
