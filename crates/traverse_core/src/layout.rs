//! Decision-vector layout.
//!
//! Every stage owns index ranges into the flat decision vector. The layout is the
//! single authority on where a variable lives: packing, bounds, the initial
//! guess, constraint evaluation and extraction all go through it.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// How the free horizon time is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeLayout {
    /// One scalar `T` shared by every interval.
    #[default]
    Shared,
    /// One copy `T_k` per stage, tied by `T_{k+1} = T_k`.
    PerStage,
}

/// Order in which stage variables are concatenated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VariableOrdering {
    /// Shared `T` first (if any), then `[X_k, T_k, U_k]` stage by stage.
    #[default]
    StageMajor,
    /// All time variables, then all states, then all controls.
    Grouped,
}

/// Variables owned by one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSlots {
    pub state: Range<usize>,
    /// `None` on the final stage.
    pub control: Option<Range<usize>>,
    /// Per-stage time copy; `None` under [`TimeLayout::Shared`].
    pub time: Option<usize>,
}

/// What a single decision variable represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableRole {
    State { stage: usize, component: usize },
    Control { stage: usize, component: usize },
    StageTime { stage: usize },
    SharedTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableLayout {
    stages: Vec<StageSlots>,
    shared_time: Option<usize>,
    len: usize,
    time_layout: TimeLayout,
    ordering: VariableOrdering,
}

impl VariableLayout {
    /// Lays out `intervals + 1` stages of `nx` states and `intervals` controls of `nu`.
    pub fn new(
        intervals: usize,
        nx: usize,
        nu: usize,
        time_layout: TimeLayout,
        ordering: VariableOrdering,
    ) -> Self {
        let per_stage_time = time_layout == TimeLayout::PerStage;
        let mut stages = Vec::with_capacity(intervals + 1);
        let mut shared_time = None;
        let mut next = 0usize;

        let mut take = |count: usize| {
            let range = next..next + count;
            next += count;
            range
        };

        match ordering {
            VariableOrdering::StageMajor => {
                if !per_stage_time {
                    shared_time = Some(take(1).start);
                }
                for k in 0..=intervals {
                    let state = take(nx);
                    let time = per_stage_time.then(|| take(1).start);
                    let control = (k < intervals).then(|| take(nu));
                    stages.push(StageSlots {
                        state,
                        control,
                        time,
                    });
                }
            }
            VariableOrdering::Grouped => {
                let times: Vec<Option<usize>> = if per_stage_time {
                    (0..=intervals).map(|_| Some(take(1).start)).collect()
                } else {
                    shared_time = Some(take(1).start);
                    vec![None; intervals + 1]
                };
                let states: Vec<Range<usize>> = (0..=intervals).map(|_| take(nx)).collect();
                let controls: Vec<Range<usize>> = (0..intervals).map(|_| take(nu)).collect();
                for (k, (state, time)) in states.into_iter().zip(times).enumerate() {
                    stages.push(StageSlots {
                        state,
                        control: controls.get(k).cloned(),
                        time,
                    });
                }
            }
        }

        Self {
            stages,
            shared_time,
            len: next,
            time_layout,
            ordering,
        }
    }

    /// Length of the decision vector.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of shooting intervals `N`.
    pub fn intervals(&self) -> usize {
        self.stages.len() - 1
    }

    pub fn stages(&self) -> &[StageSlots] {
        &self.stages
    }

    pub fn stage(&self, k: usize) -> &StageSlots {
        &self.stages[k]
    }

    pub fn time_layout(&self) -> TimeLayout {
        self.time_layout
    }

    pub fn ordering(&self) -> VariableOrdering {
        self.ordering
    }

    pub fn shared_time(&self) -> Option<usize> {
        self.shared_time
    }

    /// Index of the time variable seen by stage `k`.
    pub fn time_index(&self, k: usize) -> usize {
        match (self.stages[k].time, self.shared_time) {
            (Some(index), _) => index,
            (None, Some(index)) => index,
            (None, None) => unreachable!("layout always carries a time variable"),
        }
    }

    /// Every distinct time variable, in stage order.
    pub fn time_indices(&self) -> Vec<usize> {
        match self.shared_time {
            Some(index) => vec![index],
            None => self.stages.iter().filter_map(|s| s.time).collect(),
        }
    }

    /// Stage owning each decision variable; `None` for the shared time.
    pub fn variable_stages(&self) -> Vec<Option<usize>> {
        let mut owner = vec![None; self.len];
        for (k, slots) in self.stages.iter().enumerate() {
            for i in slots.state.clone() {
                owner[i] = Some(k);
            }
            if let Some(control) = &slots.control {
                for i in control.clone() {
                    owner[i] = Some(k);
                }
            }
            if let Some(t) = slots.time {
                owner[t] = Some(k);
            }
        }
        owner
    }

    /// Role of every decision variable, indexed like the decision vector.
    pub fn roles(&self) -> Vec<VariableRole> {
        let mut roles = vec![VariableRole::SharedTime; self.len];
        for (stage, slots) in self.stages.iter().enumerate() {
            for (component, i) in slots.state.clone().enumerate() {
                roles[i] = VariableRole::State { stage, component };
            }
            if let Some(control) = &slots.control {
                for (component, i) in control.clone().enumerate() {
                    roles[i] = VariableRole::Control { stage, component };
                }
            }
            if let Some(t) = slots.time {
                roles[t] = VariableRole::StageTime { stage };
            }
        }
        roles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_len(n: usize, nx: usize, nu: usize, layout: TimeLayout) -> usize {
        let times = match layout {
            TimeLayout::Shared => 1,
            TimeLayout::PerStage => n + 1,
        };
        (n + 1) * nx + n * nu + times
    }

    #[test]
    fn length_matches_stage_sum_for_every_variant() {
        for n in [1, 2, 7, 20] {
            for time in [TimeLayout::Shared, TimeLayout::PerStage] {
                for order in [VariableOrdering::StageMajor, VariableOrdering::Grouped] {
                    let layout = VariableLayout::new(n, 3, 2, time, order);
                    assert_eq!(layout.len(), expected_len(n, 3, 2, time));
                }
            }
        }
    }

    #[test]
    fn every_index_is_owned_exactly_once() {
        for time in [TimeLayout::Shared, TimeLayout::PerStage] {
            for order in [VariableOrdering::StageMajor, VariableOrdering::Grouped] {
                let layout = VariableLayout::new(5, 3, 2, time, order);
                let mut hits = vec![0usize; layout.len()];
                for slots in layout.stages() {
                    slots.state.clone().for_each(|i| hits[i] += 1);
                    if let Some(c) = &slots.control {
                        c.clone().for_each(|i| hits[i] += 1);
                    }
                    if let Some(t) = slots.time {
                        hits[t] += 1;
                    }
                }
                if let Some(t) = layout.shared_time() {
                    hits[t] += 1;
                }
                assert!(hits.iter().all(|&h| h == 1), "{time:?} {order:?}: {hits:?}");
            }
        }
    }

    #[test]
    fn stage_major_per_stage_is_blocked_by_stage() {
        let layout = VariableLayout::new(
            2,
            3,
            2,
            TimeLayout::PerStage,
            VariableOrdering::StageMajor,
        );
        assert_eq!(layout.stage(0).state, 0..3);
        assert_eq!(layout.stage(0).time, Some(3));
        assert_eq!(layout.stage(0).control, Some(4..6));
        assert_eq!(layout.stage(1).state, 6..9);
        assert_eq!(layout.stage(2).state, 12..15);
        assert_eq!(layout.stage(2).time, Some(15));
        assert_eq!(layout.stage(2).control, None);
        let owners = layout.variable_stages();
        assert!(owners.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn grouped_shared_puts_time_first() {
        let layout = VariableLayout::new(2, 3, 2, TimeLayout::Shared, VariableOrdering::Grouped);
        assert_eq!(layout.shared_time(), Some(0));
        assert_eq!(layout.stage(0).state, 1..4);
        assert_eq!(layout.stage(2).state, 7..10);
        assert_eq!(layout.stage(0).control, Some(10..12));
        assert_eq!(layout.time_index(2), 0);
        assert_eq!(layout.variable_stages()[0], None);
        assert_eq!(layout.roles()[0], VariableRole::SharedTime);
    }
}
