use log::{debug, error};

use crate::actions::{ActError, ActionCommand, ActionSink};
use crate::config::Binding;

/// Forwards a frame's commands to the sink, strictly in order.
///
/// A failed command is logged and reported; it is never retried, the next
/// frame's evaluation supersedes it.
pub struct Dispatcher<S> {
    sink: S,
    seal: Option<Binding>,
    emit_noop: bool,
    failures: u64,
}

impl<S: ActionSink> Dispatcher<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            seal: None,
            emit_noop: false,
            failures: 0,
        }
    }

    /// Write `NoOp` for frames that produced nothing (dry-run streams keep
    /// one output line per frame).
    pub fn with_noop(mut self, emit_noop: bool) -> Self {
        self.emit_noop = emit_noop;
        self
    }

    /// Extra action performed after each `JutsuTriggered`.
    pub fn set_seal_binding(&mut self, seal: Option<Binding>) {
        self.seal = seal;
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn dispatch(&mut self, cmds: &[ActionCommand]) -> Vec<ActError> {
        let mut errors = Vec::new();
        if cmds.is_empty() {
            if self.emit_noop {
                self.run(&ActionCommand::NoOp, &mut errors);
            }
            return errors;
        }
        for cmd in cmds {
            self.run(cmd, &mut errors);
            if matches!(cmd, ActionCommand::JutsuTriggered) {
                if let Some(extra) = self.seal.as_ref().map(Binding::command) {
                    self.run(&extra, &mut errors);
                }
            }
        }
        errors
    }

    fn run(&mut self, cmd: &ActionCommand, errors: &mut Vec<ActError>) {
        debug!("dispatch {cmd:?}");
        if let Err(e) = self.sink.execute(cmd) {
            error!("{e}");
            self.failures += 1;
            errors.push(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{MouseButton, RecordingSink};

    fn is_down(c: &ActionCommand) -> bool {
        matches!(c, ActionCommand::MouseDown { .. })
    }

    #[test]
    fn test_order_preserved_and_failures_not_retried() {
        let sink = RecordingSink {
            fail_when: Some(is_down),
            ..RecordingSink::default()
        };
        let mut d = Dispatcher::new(sink);
        let cmds = [
            ActionCommand::MouseDown { button: MouseButton::Left },
            ActionCommand::MoveCursor { x: 1.0, y: 2.0 },
            ActionCommand::MouseUp { button: MouseButton::Left },
        ];
        let errors = d.dispatch(&cmds);
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], ActError::FailedToAct { command, .. } if command.contains("MouseDown")));
        assert_eq!(d.sink().executed, cmds[1..].to_vec());
        assert_eq!(d.failures(), 1);
    }

    #[test]
    fn test_seal_binding_follows_jutsu() {
        let mut d = Dispatcher::new(RecordingSink::default());
        d.set_seal_binding(Some(Binding::Key(vec!["SUPER".into(), "TAB".into()])));
        d.dispatch(&[ActionCommand::JutsuTriggered]);
        assert_eq!(
            d.sink().executed,
            vec![
                ActionCommand::JutsuTriggered,
                ActionCommand::KeyCombo {
                    keys: vec!["SUPER".into(), "TAB".into()]
                },
            ]
        );
    }

    #[test]
    fn test_noop_only_when_requested() {
        let mut d = Dispatcher::new(RecordingSink::default());
        d.dispatch(&[]);
        assert!(d.sink().executed.is_empty());
        let mut d = d.with_noop(true);
        d.dispatch(&[]);
        assert_eq!(d.sink().executed, vec![ActionCommand::NoOp]);
    }
}
