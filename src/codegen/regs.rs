//! Asignación de registros.
//!
//! Se decide una única ubicación, registro o espacio de spill, para
//! todo el rango de vida de cada valor antes de emitir código. Los
//! rangos se recorren en orden de inicio. Un valor toma un registro
//! libre si existe. De lo contrario se desaloja al residente cuyo rango
//! termina más tarde, siempre que termine después del valor nuevo; el
//! valor desalojado pasa a un espacio de spill durante todo su rango.
//! Si ningún residente termina más tarde, el valor nuevo va a spill.

use log::debug;

use super::live::Interval;
use crate::{arch::Register, ir::Local};

/// Ubicación de un valor durante todo su rango de vida.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Location<R> {
    Register(R),
    Slot(u32),
}

pub struct Allocations<R: Register> {
    locations: Vec<Option<Location<R>>>,
    slots: u32,
    used: Vec<R>,
}

struct Resident<R> {
    reg: R,
    occupant: Option<(Local, usize)>,
}

struct Slot {
    occupant_end: Option<usize>,

    /// Primera línea a partir de la cual el espacio está libre.
    free_since: usize,
}

impl<R: Register> Allocations<R> {
    /// Planea ubicaciones para todos los rangos sobre un subconjunto
    /// del archivo de registros.
    pub fn plan(intervals: &[Option<Interval>], pool: &[R], max_live: usize) -> Self {
        let mut order: Vec<(Local, Interval)> = intervals
            .iter()
            .enumerate()
            .filter_map(|(local, interval)| interval.map(|interval| (Local(local as u32), interval)))
            .collect();

        order.sort_by_key(|&(local, interval)| (interval.start, local));

        let reserved = max_live.saturating_sub(pool.len());
        let mut slots: Vec<Slot> = (0..reserved)
            .map(|_| Slot {
                occupant_end: None,
                free_since: 0,
            })
            .collect();

        let mut residents: Vec<Resident<R>> = pool
            .iter()
            .map(|&reg| Resident {
                reg,
                occupant: None,
            })
            .collect();

        let mut locations = vec![None; intervals.len()];
        let mut used = Vec::new();

        for (local, interval) in order {
            expire(&mut residents, &mut slots, interval.start);

            let location = match residents.iter_mut().find(|r| r.occupant.is_none()) {
                Some(resident) => {
                    resident.occupant = Some((local, interval.end));
                    Location::Register(resident.reg)
                }

                None => {
                    let victim = residents
                        .iter_mut()
                        .filter(|r| matches!(r.occupant, Some((_, end)) if end > interval.end))
                        .max_by_key(|r| r.occupant.map(|(victim, end)| (end, victim)));

                    match victim {
                        Some(resident) => {
                            let (victim, victim_end) = resident
                                .occupant
                                .replace((local, interval.end))
                                .expect("victim register is not occupied");

                            let victim_start = intervals[victim.0 as usize]
                                .expect("resident without live range")
                                .start;

                            let slot = take_slot(&mut slots, victim_start, victim_end);
                            locations[victim.0 as usize] = Some(Location::Slot(slot));

                            Location::Register(resident.reg)
                        }

                        None => Location::Slot(take_slot(&mut slots, interval.start, interval.end)),
                    }
                }
            };

            if let Location::Register(reg) = location {
                if !used.contains(&reg) {
                    used.push(reg);
                }
            }

            locations[local.0 as usize] = Some(location);
        }

        // Se preserva el orden del archivo de registros
        used.sort_by_key(|reg| pool.iter().position(|other| other == reg));

        debug!(
            "{} live ranges, max live {}, {} registers, {} spill slots ({} estimated)",
            intervals.iter().flatten().count(),
            max_live,
            used.len(),
            slots.len(),
            reserved
        );

        Allocations {
            locations,
            slots: slots.len() as u32,
            used,
        }
    }

    /// Ubicación de un valor. Es un error interno consultar un valor
    /// sin rango de vida.
    pub fn location(&self, Local(local): Local) -> Location<R> {
        self.locations
            .get(local as usize)
            .copied()
            .flatten()
            .unwrap_or_else(|| panic!("value %{} has no live range", local))
    }

    /// Cantidad de espacios de spill requeridos.
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Registros asignados al menos una vez.
    pub fn used(&self) -> &[R] {
        &self.used
    }
}

fn expire<R>(residents: &mut [Resident<R>], slots: &mut [Slot], line: usize) {
    for resident in residents.iter_mut() {
        if matches!(resident.occupant, Some((_, end)) if end < line) {
            resident.occupant = None;
        }
    }

    for slot in slots.iter_mut() {
        if let Some(end) = slot.occupant_end {
            if end < line {
                slot.occupant_end = None;
                slot.free_since = end + 1;
            }
        }
    }
}

/// Un espacio solo puede reutilizarse si estuvo libre durante todo
/// el rango que se le asigna.
fn take_slot(slots: &mut Vec<Slot>, start: usize, end: usize) -> u32 {
    let index = match slots
        .iter()
        .position(|slot| slot.occupant_end.is_none() && slot.free_since <= start)
    {
        Some(index) => index,
        None => {
            slots.push(Slot {
                occupant_end: None,
                free_since: 0,
            });

            slots.len() - 1
        }
    };

    slots[index].occupant_end = Some(end);
    index as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct R(u8);

    impl fmt::Display for R {
        fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(fmt, "r{}", self.0)
        }
    }

    impl Register for R {
        const FILE: &'static [Self] = &[R(0), R(1), R(2)];
        const RETURN: Self = R(0);
    }

    fn ranges(ranges: &[(usize, usize)]) -> Vec<Option<Interval>> {
        ranges
            .iter()
            .map(|&(start, end)| Some(Interval { start, end }))
            .collect()
    }

    #[test]
    fn reuses_expired_registers() {
        let intervals = ranges(&[(0, 1), (2, 3), (2, 4)]);
        let plan = Allocations::plan(&intervals, &R::FILE[..2], 2);

        assert_eq!(plan.location(Local(0)), Location::Register(R(0)));
        assert_eq!(plan.location(Local(1)), Location::Register(R(0)));
        assert_eq!(plan.location(Local(2)), Location::Register(R(1)));
        assert_eq!(plan.slots(), 0);
        assert_eq!(plan.used(), &[R(0), R(1)]);
    }

    #[test]
    fn evicts_furthest_end() {
        let intervals = ranges(&[(0, 10), (1, 3), (2, 4)]);
        let plan = Allocations::plan(&intervals, &R::FILE[..2], 3);

        assert_eq!(plan.location(Local(0)), Location::Slot(0));
        assert_eq!(plan.location(Local(1)), Location::Register(R(1)));
        assert_eq!(plan.location(Local(2)), Location::Register(R(0)));
        assert_eq!(plan.slots(), 1);
    }

    #[test]
    fn spills_new_value_when_it_ends_last() {
        let intervals = ranges(&[(0, 5), (1, 5), (2, 9)]);
        let plan = Allocations::plan(&intervals, &R::FILE[..2], 3);

        assert_eq!(plan.location(Local(0)), Location::Register(R(0)));
        assert_eq!(plan.location(Local(1)), Location::Register(R(1)));
        assert_eq!(plan.location(Local(2)), Location::Slot(0));
    }

    #[test]
    fn slots_are_not_shared_by_overlapping_ranges() {
        // %0 ocupa el espacio 0 hasta la línea 3. %2 es desalojado en la
        // línea 5 pero vive desde la línea 2, así que no puede reutilizarlo.
        let intervals = ranges(&[(0, 3), (1, 20), (2, 30), (5, 6)]);
        let plan = Allocations::plan(&intervals, &R::FILE[..1], 3);

        let slot = |local| match plan.location(Local(local)) {
            Location::Slot(slot) => slot,
            Location::Register(_) => panic!("%{} should be spilled", local),
        };

        assert_eq!(plan.location(Local(0)), Location::Register(R(0)));
        assert_ne!(slot(1), slot(2));
        assert_eq!(plan.location(Local(3)), Location::Register(R(0)));
        assert!(plan.slots() >= 2);
    }

    #[test]
    fn values_without_range_are_internal_faults() {
        let plan = Allocations::<R>::plan(&[None], &R::FILE[..1], 0);
        let result = std::panic::catch_unwind(|| plan.location(Local(0)));

        assert!(result.is_err());
    }
}
