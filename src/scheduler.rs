use serde::Serialize;
use tracing::info;

use crate::domain::{WorkUnit, units_in_range, validate_year};
use crate::error::IngestError;
use crate::processor::{ProcessUnit, UnitOutcome, UnitReport};
use crate::progress::ProgressOracle;

#[derive(Debug, Clone, Serialize)]
pub struct AdvanceResult {
    pub start: i32,
    pub end: i32,
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub reports: Vec<UnitReport>,
}

/// Walks `start..=end` quarter by quarter in chronological order and hands
/// at most `max_units` pending units to the processor. Done units and units
/// claimed by another invocation are skipped without counting; failed units
/// count, so one invocation never loops on a broken quarter.
pub fn advance<O, P>(
    oracle: &O,
    processor: &P,
    start: i32,
    end: i32,
    geography: &str,
    max_units: usize,
) -> Result<AdvanceResult, IngestError>
where
    O: ProgressOracle + ?Sized,
    P: ProcessUnit + ?Sized,
{
    let start = validate_year(start)?;
    let end = validate_year(end)?;
    if start > end {
        return Err(IngestError::InvalidRange { start, end });
    }

    let mut result = AdvanceResult {
        start,
        end,
        processed: 0,
        completed: 0,
        failed: 0,
        reports: Vec::new(),
    };

    for unit in units_in_range(start, end) {
        if result.processed >= max_units {
            break;
        }
        if oracle.is_done(&unit) {
            continue;
        }
        let report = processor.process_pending(&unit, geography);
        if report.attempted() {
            result.processed += 1;
            match report.outcome {
                UnitOutcome::Completed => result.completed += 1,
                _ => result.failed += 1,
            }
        }
        result.reports.push(report);
    }

    if result.processed == 0 {
        info!(start, end, "range already complete");
    } else {
        info!(
            start,
            end,
            processed = result.processed,
            completed = result.completed,
            failed = result.failed,
            "range advanced"
        );
    }
    Ok(result)
}

pub fn pending_units<O: ProgressOracle + ?Sized>(
    oracle: &O,
    start: i32,
    end: i32,
) -> Result<Vec<WorkUnit>, IngestError> {
    let start = validate_year(start)?;
    let end = validate_year(end)?;
    if start > end {
        return Err(IngestError::InvalidRange { start, end });
    }
    Ok(units_in_range(start, end)
        .filter(|unit| !oracle.is_done(unit))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    use super::*;

    struct SetOracle(BTreeSet<WorkUnit>);

    impl ProgressOracle for SetOracle {
        fn is_done(&self, unit: &WorkUnit) -> bool {
            self.0.contains(unit)
        }
    }

    #[derive(Default)]
    struct Recorder(RefCell<Vec<WorkUnit>>);

    impl ProcessUnit for Recorder {
        fn process(&self, _unit: &WorkUnit, _geography: &str) -> UnitReport {
            panic!("the scheduler already checked the oracle");
        }

        fn process_pending(&self, unit: &WorkUnit, _geography: &str) -> UnitReport {
            self.0.borrow_mut().push(*unit);
            UnitReport {
                unit: *unit,
                outcome: UnitOutcome::Completed,
                curated: Vec::new(),
                error: None,
                elapsed_ms: 0,
            }
        }
    }

    struct CountingOracle(RefCell<usize>);

    impl ProgressOracle for CountingOracle {
        fn is_done(&self, _unit: &WorkUnit) -> bool {
            *self.0.borrow_mut() += 1;
            false
        }
    }

    #[test]
    fn visits_pending_units_in_order_up_to_cap() {
        let done = BTreeSet::from([WorkUnit::new(1993, 2).unwrap()]);
        let oracle = SetOracle(done);
        let recorder = Recorder::default();

        let result = advance(&oracle, &recorder, 1993, 1993, "All", 2).unwrap();

        assert_eq!(result.processed, 2);
        assert_eq!(
            *recorder.0.borrow(),
            vec![WorkUnit::new(1993, 1).unwrap(), WorkUnit::new(1993, 3).unwrap()]
        );
    }

    #[test]
    fn each_unit_is_checked_once() {
        let oracle = CountingOracle(RefCell::new(0));
        let recorder = Recorder::default();

        let result = advance(&oracle, &recorder, 1993, 1993, "All", 4).unwrap();

        assert_eq!(result.completed, 4);
        assert_eq!(*oracle.0.borrow(), 4);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let oracle = SetOracle(BTreeSet::new());
        let err = advance(&oracle, &Recorder::default(), 2001, 1999, "All", 1).unwrap_err();
        assert!(matches!(err, IngestError::InvalidRange { start: 2001, end: 1999 }));
    }

    #[test]
    fn pending_lists_everything_not_done() {
        let done = BTreeSet::from([WorkUnit::new(2000, 4).unwrap()]);
        let pending = pending_units(&SetOracle(done), 2000, 2000).unwrap();
        assert_eq!(pending.len(), 3);
    }
}
