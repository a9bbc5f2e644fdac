/// Runs a cleanup action after a body, only when a predicate over the body's
/// outcome holds
///
/// The predicate sees every exit of the body, including early returns
/// through `?` inside it.
pub struct DeferCond<C, A> {
    cond: C,
    action: A,
}

impl<C, A> DeferCond<C, A> {
    pub fn new(cond: C, action: A) -> Self {
        Self { cond, action }
    }

    pub fn run<S, T>(self, state: &mut S, body: impl FnOnce(&mut S) -> T) -> T
    where
        C: FnOnce(&T) -> bool,
        A: FnOnce(&mut S),
    {
        let outcome = body(state);
        if (self.cond)(&outcome) {
            (self.action)(state);
        }
        outcome
    }

    /// Like `run`, but a failing action replaces a successful outcome
    pub fn try_run<S, T, E>(self, state: &mut S, body: impl FnOnce(&mut S) -> Result<T, E>) -> Result<T, E>
    where
        C: FnOnce(&Result<T, E>) -> bool,
        A: FnOnce(&mut S) -> Result<(), E>,
    {
        let outcome = body(state);
        if (self.cond)(&outcome) {
            (self.action)(state)?;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finish(fail: bool, early: bool) -> (Result<u32, String>, Vec<&'static str>) {
        let mut log = Vec::new();
        let outcome = DeferCond::new(
            |outcome: &Result<u32, String>| matches!(outcome, Ok(0)),
            |log: &mut Vec<&'static str>| log.push("end"),
        )
        .run(&mut log, |log| {
            log.push("body");
            if early {
                return Ok(0);
            }
            if fail {
                Err::<u32, String>("boom".to_string())?;
            }
            Ok(1)
        });
        (outcome, log)
    }

    #[test]
    fn test_action_runs_on_matching_outcome() {
        let (outcome, log) = finish(false, true);
        assert_eq!(outcome, Ok(0));
        assert_eq!(log, vec!["body", "end"]);
    }

    #[test]
    fn test_action_skipped_otherwise() {
        let (outcome, log) = finish(false, false);
        assert_eq!(outcome, Ok(1));
        assert_eq!(log, vec!["body"]);

        let (outcome, log) = finish(true, false);
        assert!(outcome.is_err());
        assert_eq!(log, vec!["body"]);
    }

    #[test]
    fn test_failing_action_replaces_outcome() {
        let mut log = Vec::new();
        let outcome = DeferCond::new(
            |outcome: &Result<u32, String>| outcome.is_ok(),
            |log: &mut Vec<&'static str>| {
                log.push("end");
                Err("no space for end".to_string())
            },
        )
        .try_run(&mut log, |log| {
            log.push("body");
            Ok(0)
        });
        assert_eq!(outcome, Err("no space for end".to_string()));
        assert_eq!(log, vec!["body", "end"]);
    }
}
