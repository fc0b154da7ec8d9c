//! Phase selection for each invocation argument.

use std::fmt;

/// One stage of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    CleanupBefore,
    Setup,
    TapSyntax,
    FormulaeDetect,
    Formulae,
    FormulaeDependents,
    CleanupAfter,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::CleanupBefore,
        Phase::Setup,
        Phase::TapSyntax,
        Phase::FormulaeDetect,
        Phase::Formulae,
        Phase::FormulaeDependents,
        Phase::CleanupAfter,
    ];

    /// Report name, also used as the JUnit testsuite name.
    pub fn name(self) -> &'static str {
        match self {
            Phase::CleanupBefore => "cleanup_before",
            Phase::Setup => "setup",
            Phase::TapSyntax => "tap_syntax",
            Phase::FormulaeDetect => "formulae_detect",
            Phase::Formulae => "formulae",
            Phase::FormulaeDependents => "formulae_dependents",
            Phase::CleanupAfter => "cleanup_after",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flags that influence which phases run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseSelection {
    /// The single phase named by an `--only-*` flag.
    pub only: Option<Phase>,
    pub skip_setup: bool,
    pub skip_dependents: bool,
    /// Explicit testing/added/deleted lists replace detection.
    pub explicit_lists: bool,
}

/// Position of the current argument within the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentPosition {
    pub first: bool,
    pub last: bool,
}

impl ArgumentPosition {
    pub fn new(index: usize, total: usize) -> Self {
        Self {
            first: index == 0,
            last: index + 1 >= total,
        }
    }
}

/// Phases to run for one argument, excluding `CleanupAfter`.
///
/// `CleanupAfter` is returned separately by [`runs_cleanup_after`] because the
/// runner executes it in a guaranteed-release block.
pub fn plan_phases(selection: PhaseSelection, position: ArgumentPosition) -> Vec<Phase> {
    let wants = |phase: Phase| match selection.only {
        None => true,
        Some(only) => {
            only == phase || (only == Phase::Formulae && phase == Phase::FormulaeDependents)
        }
    };

    let mut phases = Vec::new();
    if position.first && wants(Phase::CleanupBefore) {
        phases.push(Phase::CleanupBefore);
    }
    if position.first && !selection.skip_setup && wants(Phase::Setup) {
        phases.push(Phase::Setup);
    }
    if wants(Phase::TapSyntax) {
        phases.push(Phase::TapSyntax);
    }
    if !selection.explicit_lists && wants(Phase::FormulaeDetect) {
        phases.push(Phase::FormulaeDetect);
    }
    if wants(Phase::Formulae) {
        phases.push(Phase::Formulae);
    }
    if !selection.skip_dependents && wants(Phase::FormulaeDependents) {
        phases.push(Phase::FormulaeDependents);
    }
    phases
}

pub fn runs_cleanup_after(selection: PhaseSelection, position: ArgumentPosition) -> bool {
    position.last && selection.only.is_none_or(|only| only == Phase::CleanupAfter)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONLY: ArgumentPosition = ArgumentPosition {
        first: true,
        last: true,
    };

    #[test]
    fn default_runs_everything() {
        let phases = plan_phases(PhaseSelection::default(), ONLY);
        assert_eq!(phases, Phase::ALL[..6].to_vec());
        assert!(runs_cleanup_after(PhaseSelection::default(), ONLY));
    }

    #[test]
    fn only_formulae_includes_dependents() {
        let selection = PhaseSelection {
            only: Some(Phase::Formulae),
            ..PhaseSelection::default()
        };
        assert_eq!(
            plan_phases(selection, ONLY),
            vec![Phase::Formulae, Phase::FormulaeDependents]
        );
        assert!(!runs_cleanup_after(selection, ONLY));
    }

    #[test]
    fn explicit_lists_replace_detection() {
        let selection = PhaseSelection {
            explicit_lists: true,
            skip_setup: true,
            skip_dependents: true,
            ..PhaseSelection::default()
        };
        assert_eq!(
            plan_phases(selection, ONLY),
            vec![Phase::CleanupBefore, Phase::TapSyntax, Phase::Formulae]
        );
    }

    #[test]
    fn middle_argument_skips_cleanup_and_setup() {
        let position = ArgumentPosition::new(1, 3);
        assert_eq!(
            plan_phases(PhaseSelection::default(), position),
            vec![
                Phase::TapSyntax,
                Phase::FormulaeDetect,
                Phase::Formulae,
                Phase::FormulaeDependents
            ]
        );
        assert!(!runs_cleanup_after(PhaseSelection::default(), position));
        assert!(runs_cleanup_after(
            PhaseSelection::default(),
            ArgumentPosition::new(2, 3)
        ));
    }

    #[test]
    fn only_cleanup_after() {
        let selection = PhaseSelection {
            only: Some(Phase::CleanupAfter),
            ..PhaseSelection::default()
        };
        assert!(plan_phases(selection, ONLY).is_empty());
        assert!(runs_cleanup_after(selection, ONLY));
    }
}
