//! Zone targeting state machine
//!
//! The pure bookkeeping behind a zone's speed decisions: floor/ceiling
//! clamping, the per-group active-allow conjunction, the target lock stack,
//! and pending increase/decrease fusion. Every mutation returns a [`Push`]
//! describing what (if anything) must reach the fan hardware, so the rules
//! are testable without a bus.

use std::collections::HashMap;

/// What a state change wants written to the fans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// Nothing to write
    None,
    /// Normal clamped target write, suppressed per-fan while locked
    Target { value: u64, locked: bool },
    /// A lock write: always reaches the fans
    Lock(u64),
    /// Safety write bypassing active-allow gating
    Unconditional(u64),
}

#[derive(Debug)]
pub struct Targeting {
    pub floor: u64,
    pub ceiling: u64,
    pub target: u64,
    full_speed: u64,
    /// Base for delta requests; 0 means "current target"
    pub request_base: u64,
    locks: Vec<u64>,
    active: HashMap<usize, bool>,
    inc_delta: u64,
    dec_delta: u64,
    prev_ceiling_mean: Option<f64>,
}

impl Targeting {
    pub fn new(full_speed: u64, default_floor: u64, default_ceiling: u64) -> Self {
        Self {
            floor: default_floor,
            ceiling: default_ceiling,
            target: full_speed,
            full_speed,
            request_base: 0,
            locks: Vec::new(),
            active: HashMap::new(),
            inc_delta: 0,
            dec_delta: 0,
            prev_ceiling_mean: None,
        }
    }

    pub fn all_active(&self) -> bool {
        self.active.values().all(|v| *v)
    }

    pub fn locked(&self) -> bool {
        !self.locks.is_empty()
    }

    pub fn locks(&self) -> &[u64] {
        &self.locks
    }

    pub fn active_groups(&self) -> &HashMap<usize, bool> {
        &self.active
    }

    /// Clamp into `[floor, ceiling]` and cache. Pushes only while every
    /// group allows automatic control.
    pub fn set_speed(&mut self, raw: u64) -> Push {
        self.target = raw.clamp(self.floor, self.ceiling);
        if self.all_active() {
            Push::Target {
                value: self.target,
                locked: self.locked(),
            }
        } else {
            Push::None
        }
    }

    /// The safety fallback: bypasses the ceiling and the active gate,
    /// honoring only locks (which can only hold the value higher).
    pub fn set_full_speed(&mut self) -> Push {
        self.target = self.full_speed;
        Push::Unconditional(
            self.full_speed
                .max(self.locks.iter().copied().max().unwrap_or(0)),
        )
    }

    /// Update one group's vote; regaining full agreement re-pushes the
    /// cached target.
    pub fn set_active_allow(&mut self, group: usize, allow: bool) -> Push {
        let was = self.all_active();
        self.active.insert(group, allow);
        let now = self.all_active();
        if now && !was {
            Push::Target {
                value: self.target,
                locked: self.locked(),
            }
        } else {
            Push::None
        }
    }

    /// Hold the written target at `max(value, held locks)`.
    pub fn lock(&mut self, value: u64) -> Push {
        self.locks.push(value);
        Push::Lock(self.locks.iter().copied().max().unwrap_or(value))
    }

    /// Pop one matching lock. The next-highest lock takes over; with none
    /// left the cached target resumes (when control is allowed). `None`
    /// means no matching lock was held.
    pub fn unlock(&mut self, value: u64) -> Option<Push> {
        let position = self.locks.iter().position(|l| *l == value)?;
        self.locks.remove(position);

        Some(match self.locks.iter().copied().max() {
            Some(highest) => Push::Lock(highest),
            None if self.all_active() => Push::Target {
                value: self.target,
                locked: false,
            },
            None => Push::None,
        })
    }

    /// Raise the floor (never above the ceiling); the target follows up if
    /// it fell below.
    pub fn set_floor(&mut self, value: u64) -> Push {
        self.floor = value.min(self.ceiling);
        if self.target < self.floor {
            let floor = self.floor;
            self.set_speed(floor)
        } else {
            Push::None
        }
    }

    /// Move the ceiling (never below the floor); the target follows down
    /// if it rose above.
    pub fn set_ceiling(&mut self, value: u64) -> Push {
        self.ceiling = value.max(self.floor);
        if self.target > self.ceiling {
            let ceiling = self.ceiling;
            self.set_speed(ceiling)
        } else {
            Push::None
        }
    }

    /// Fold in an increase request (running max). Returns true when the
    /// caller should arm the increase-delay timer.
    pub fn request_increase(&mut self, delta: u64) -> bool {
        if delta == 0 {
            return false;
        }
        let was_pending = self.inc_delta > 0;
        self.inc_delta = self.inc_delta.max(delta);
        !was_pending
    }

    /// Fold in a decrease request (running min of nonzero requests).
    pub fn request_decrease(&mut self, delta: u64) {
        if delta == 0 {
            return;
        }
        self.dec_delta = if self.dec_delta == 0 {
            delta
        } else {
            self.dec_delta.min(delta)
        };
    }

    pub fn increase_pending(&self) -> bool {
        self.inc_delta > 0
    }

    /// Consume the pending increase: the raw target to request, if any.
    pub fn take_increase(&mut self) -> Option<u64> {
        let delta = std::mem::take(&mut self.inc_delta);
        (delta > 0).then(|| self.delta_base().saturating_add(delta))
    }

    /// Consume the pending decrease. Skipped (and cleared) while an
    /// increase is pending; increases outrank decreases.
    pub fn take_decrease(&mut self, increase_armed: bool) -> Option<u64> {
        let delta = std::mem::take(&mut self.dec_delta);
        if delta == 0 || increase_armed || self.inc_delta > 0 {
            return None;
        }
        Some(self.delta_base().saturating_sub(delta))
    }

    fn delta_base(&self) -> u64 {
        if self.request_base > 0 {
            self.request_base
        } else {
            self.target
        }
    }

    /// Remember the mean the last ceiling decision saw, returning the one
    /// before it.
    pub fn swap_ceiling_mean(&mut self, mean: f64) -> Option<f64> {
        self.prev_ceiling_mean.replace(mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targeting() -> Targeting {
        Targeting::new(10500, 3000, 10500)
    }

    #[test]
    fn test_clamp_invariant() {
        let mut t = targeting();
        t.set_speed(1000);
        assert_eq!(t.target, 3000);
        t.set_speed(20000);
        assert_eq!(t.target, 10500);
        t.set_speed(5000);
        assert_eq!(t.target, 5000);
        assert!(t.floor <= t.target && t.target <= t.ceiling);
    }

    #[test]
    fn test_floor_raises_target() {
        let mut t = targeting();
        t.set_speed(4000);
        let push = t.set_floor(6000);
        assert_eq!(t.target, 6000);
        assert_eq!(
            push,
            Push::Target {
                value: 6000,
                locked: false
            }
        );
    }

    #[test]
    fn test_ceiling_lowers_target() {
        let mut t = targeting();
        t.set_speed(9000);
        let push = t.set_ceiling(8000);
        assert_eq!(t.target, 8000);
        assert_eq!(
            push,
            Push::Target {
                value: 8000,
                locked: false
            }
        );
    }

    #[test]
    fn test_floor_never_exceeds_ceiling() {
        let mut t = targeting();
        t.set_ceiling(8000);
        t.set_floor(9000);
        assert_eq!(t.floor, 8000);
        assert!(t.floor <= t.ceiling);
    }

    #[test]
    fn test_active_allow_caches_and_repushes() {
        // Scenario: a group denies control at a forced 10500; a later
        // set_speed(3000) is cached but not pushed; re-allow pushes the
        // cached 3000.
        let mut t = targeting();
        t.set_speed(10500);
        assert_eq!(t.set_active_allow(0, false), Push::None);

        assert_eq!(t.set_speed(3000), Push::None);
        assert_eq!(t.target, 3000);

        let push = t.set_active_allow(0, true);
        assert_eq!(
            push,
            Push::Target {
                value: 3000,
                locked: false
            }
        );
    }

    #[test]
    fn test_any_group_vetoes() {
        let mut t = targeting();
        t.set_active_allow(0, true);
        t.set_active_allow(1, false);
        assert!(!t.all_active());
        // Re-allowing only one of two groups is not enough
        assert_eq!(t.set_active_allow(1, true), Push::Target { value: 10500, locked: false });
        assert!(t.all_active());
    }

    #[test]
    fn test_lock_stack() {
        let mut t = targeting();
        assert_eq!(t.lock(8000), Push::Lock(8000));
        assert_eq!(t.lock(6000), Push::Lock(8000));
        // setSpeed cannot write through locks
        assert_eq!(
            t.set_speed(4000),
            Push::Target {
                value: 4000,
                locked: true
            }
        );

        // Popping the highest lock falls back to the next one
        assert_eq!(t.unlock(8000), Some(Push::Lock(6000)));
        // Popping the last lock resumes the cached target
        assert_eq!(
            t.unlock(6000),
            Some(Push::Target {
                value: 4000,
                locked: false
            })
        );
        // Unlock without a matching lock is ignored
        assert_eq!(t.unlock(9999), None);
    }

    #[test]
    fn test_full_speed_honors_locks() {
        let mut t = targeting();
        t.lock(12000);
        assert_eq!(t.set_full_speed(), Push::Unconditional(12000));
        t.unlock(12000);
        assert_eq!(t.set_full_speed(), Push::Unconditional(10500));
    }

    #[test]
    fn test_increase_fusion_and_base() {
        let mut t = targeting();
        t.set_speed(5000);
        assert!(t.request_increase(200));
        // A second request while pending fuses without re-arming
        assert!(!t.request_increase(500));
        assert!(!t.request_increase(300));
        assert_eq!(t.take_increase(), Some(5500));
        assert_eq!(t.take_increase(), None);
    }

    #[test]
    fn test_increase_uses_request_base() {
        let mut t = targeting();
        t.set_speed(5000);
        t.request_base = 7000;
        t.request_increase(200);
        assert_eq!(t.take_increase(), Some(7200));
    }

    #[test]
    fn test_decrease_fusion_min_nonzero() {
        let mut t = targeting();
        t.set_speed(8000);
        t.request_decrease(400);
        t.request_decrease(200);
        t.request_decrease(600);
        assert_eq!(t.take_decrease(false), Some(7800));
        assert_eq!(t.take_decrease(false), None);
    }

    #[test]
    fn test_pending_increase_outranks_decrease() {
        let mut t = targeting();
        t.set_speed(8000);
        t.request_decrease(200);
        t.request_increase(400);
        // Decrease tick while an increase is pending: dropped
        assert_eq!(t.take_decrease(true), None);
        assert_eq!(t.take_increase(), Some(8400));
    }

    #[test]
    fn test_ceiling_mean_swap() {
        let mut t = targeting();
        assert_eq!(t.swap_ceiling_mean(7500.0), None);
        assert_eq!(t.swap_ceiling_mean(8500.0), Some(7500.0));
    }
}
