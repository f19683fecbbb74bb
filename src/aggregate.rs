//! Virtual pack built from 2 to 4 series or parallel connected packs.

use crate::battery::Battery;
use crate::config::{BatteryConfig, MAX_LINKS};
use crate::snapshot::BatterySnapshot;
use crate::{Error, Result};

/// Merges member snapshots into one, in member order.
///
/// Voltage and cell count add up, capacity and SoC take the weakest member,
/// FETs are only on when on everywhere. Current is the mean over the
/// snapshots given, so a member left out of a lenient cycle does not count.
/// Temperatures come from the first snapshot only.
pub fn combine(members: &[BatterySnapshot], config: &BatteryConfig) -> BatterySnapshot {
    let address = members
        .iter()
        .map(|m| m.address.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let mut aggregate = BatterySnapshot::new(VirtualBattery::BATTERY_TYPE, address);
    let Some(first) = members.first() else {
        return aggregate;
    };

    aggregate.capacity = f32::INFINITY;
    aggregate.capacity_remain = f32::INFINITY;
    aggregate.soc = f32::INFINITY;
    aggregate.charge_fet = true;
    aggregate.discharge_fet = true;
    for member in members {
        aggregate.voltage += member.voltage;
        aggregate.current += member.current;
        aggregate.cycles = aggregate.cycles.max(member.cycles);
        aggregate.capacity = aggregate.capacity.min(member.capacity);
        aggregate.capacity_remain = aggregate.capacity_remain.min(member.capacity_remain);
        aggregate.soc = aggregate.soc.min(member.soc);
        aggregate.charge_fet &= member.charge_fet;
        aggregate.discharge_fet &= member.discharge_fet;
        aggregate.cells.extend(member.cells.iter().cloned());
        aggregate.protection.merge(&member.protection);
    }
    aggregate.current /= members.len() as f32;
    aggregate.cell_count = u8::try_from(aggregate.cells.len()).unwrap_or(u8::MAX);
    aggregate.temperatures = first.temperatures.clone();
    aggregate.mosfet_temperature = first.mosfet_temperature;
    aggregate.apply_limits(config);
    aggregate
}

pub struct VirtualBattery {
    members: Vec<Box<dyn Battery>>,
    config: BatteryConfig,
    /// Set once every member delivered a full dataset
    warmed_up: bool,
    snapshot: BatterySnapshot,
}

impl VirtualBattery {
    pub const BATTERY_TYPE: &'static str = "Virtual";

    pub fn new(members: Vec<Box<dyn Battery>>, config: BatteryConfig) -> Result<Self> {
        if !(2..=MAX_LINKS).contains(&members.len()) {
            return Err(Error::Configuration(format!(
                "a virtual battery needs 2 to {MAX_LINKS} members, got {}",
                members.len()
            )));
        }
        Ok(Self {
            members,
            config,
            warmed_up: false,
            snapshot: BatterySnapshot::new(Self::BATTERY_TYPE, ""),
        })
    }

    pub fn is_warmed_up(&self) -> bool {
        self.warmed_up
    }

    /// Strict before warm-up (every member), lenient after (any member).
    fn accept(&self, ready: &[bool]) -> bool {
        if self.warmed_up {
            ready.iter().any(|r| *r)
        } else {
            ready.iter().all(|r| *r)
        }
    }

    fn recompute(&mut self, ready: &[bool]) {
        let snapshots: Vec<BatterySnapshot> = self
            .members
            .iter()
            .zip(ready)
            .filter(|(_, ready)| **ready)
            .map(|(member, _)| member.get_current_snapshot())
            .collect();
        let mut snapshot = combine(&snapshots, &self.config);
        // temperatures always follow the first member, stale or not
        if !ready[0] {
            let first = self.members[0].get_current_snapshot();
            snapshot.temperatures = first.temperatures;
            snapshot.mosfet_temperature = first.mosfet_temperature;
        }
        self.snapshot = snapshot;
    }
}

impl Battery for VirtualBattery {
    fn get_settings(&mut self) -> bool {
        let ready: Vec<bool> = self.members.iter_mut().map(|m| m.get_settings()).collect();
        let accepted = self.accept(&ready);
        if accepted {
            self.recompute(&ready);
        }
        accepted
    }

    fn refresh_data(&mut self) -> bool {
        let settings: Vec<bool> = self.members.iter_mut().map(|m| m.get_settings()).collect();
        let data: Vec<bool> = self.members.iter_mut().map(|m| m.refresh_data()).collect();
        let ready: Vec<bool> = settings.iter().zip(&data).map(|(s, d)| *s && *d).collect();
        if !self.accept(&ready) {
            return false;
        }
        if !self.warmed_up {
            log::info!("All {} batteries delivered data", self.members.len());
            self.warmed_up = true;
        }
        self.recompute(&ready);
        true
    }

    fn get_current_snapshot(&self) -> BatterySnapshot {
        self.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Severity;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        snapshot: BatterySnapshot,
        settings: bool,
        data: bool,
    }

    #[derive(Clone, Default)]
    struct FakeBattery(Arc<Mutex<FakeState>>);

    impl FakeBattery {
        fn ready(snapshot: BatterySnapshot) -> Self {
            Self(Arc::new(Mutex::new(FakeState {
                snapshot,
                settings: true,
                data: true,
            })))
        }

        fn set_available(&self, available: bool) {
            let mut state = self.0.lock().unwrap();
            state.settings = available;
            state.data = available;
        }
    }

    impl Battery for FakeBattery {
        fn get_settings(&mut self) -> bool {
            self.0.lock().unwrap().settings
        }

        fn refresh_data(&mut self) -> bool {
            self.0.lock().unwrap().data
        }

        fn get_current_snapshot(&self) -> BatterySnapshot {
            self.0.lock().unwrap().snapshot.clone()
        }
    }

    fn pack(address: &str, cells: u8, capacity: f32, soc: f32, current: f32) -> BatterySnapshot {
        let mut snapshot = BatterySnapshot::new("JBD BT", address);
        snapshot.set_cells(cells, std::iter::empty());
        for cell in &mut snapshot.cells {
            cell.voltage = Some(3.3);
        }
        snapshot.voltage = 3.3 * f32::from(cells);
        snapshot.capacity = capacity;
        snapshot.capacity_remain = capacity * soc / 100.0;
        snapshot.soc = soc;
        snapshot.current = current;
        snapshot.charge_fet = true;
        snapshot.discharge_fet = true;
        snapshot
    }

    #[test]
    fn combines_members() {
        let mut a = pack("70:3e:97:08:00:62", 4, 80.0, 50.0, 2.0);
        a.temperatures = vec![21.5, 22.0];
        let mut b = pack("a4:c1:37:40:89:5e", 4, 100.0, 70.0, 4.0);
        b.charge_fet = false;
        b.cycles = 9;
        b.temperatures = vec![40.0];
        b.protection.voltage_high = Severity::Alarm;

        let aggregate = combine(&[a, b], &BatteryConfig::default());
        assert_eq!(aggregate.battery_type, "Virtual");
        assert_eq!(aggregate.capacity, 80.0);
        assert_eq!(aggregate.capacity_remain, 40.0);
        assert_eq!(aggregate.soc, 50.0);
        assert_eq!(aggregate.current, 3.0);
        assert!(!aggregate.charge_fet);
        assert!(aggregate.discharge_fet);
        assert_eq!(aggregate.cycles, 9);
        assert_eq!(aggregate.cell_count, 8);
        assert_eq!(aggregate.cells.len(), 8);
        assert!((aggregate.voltage - 26.4).abs() < 1e-4);
        assert_eq!(aggregate.temperatures, vec![21.5, 22.0]);
        assert_eq!(aggregate.protection.voltage_high, Severity::Alarm);
        assert!((aggregate.max_battery_voltage - 8.0 * 3.45).abs() < 1e-4);
    }

    #[test]
    fn cells_concatenated_in_member_order() {
        let mut a = pack("a", 2, 100.0, 50.0, 0.0);
        a.cells[1].voltage = Some(3.1);
        let mut b = pack("b", 3, 100.0, 50.0, 0.0);
        b.cells[0].voltage = Some(3.5);
        let aggregate = combine(&[a, b], &BatteryConfig::default());
        assert_eq!(
            aggregate.cell_voltages(),
            vec![Some(3.3), Some(3.1), Some(3.5), Some(3.3), Some(3.3)]
        );
        assert_eq!(aggregate.address, "a,b");
    }

    #[test]
    fn member_count_checked() {
        let one: Vec<Box<dyn Battery>> = vec![Box::new(FakeBattery::default())];
        assert!(matches!(
            VirtualBattery::new(one, BatteryConfig::default()),
            Err(Error::Configuration(_))
        ));
        let five: Vec<Box<dyn Battery>> = (0..5)
            .map(|_| Box::new(FakeBattery::default()) as Box<dyn Battery>)
            .collect();
        assert!(VirtualBattery::new(five, BatteryConfig::default()).is_err());
    }

    #[test]
    fn strict_until_warmed_up_then_lenient() {
        let mut first = pack("a", 4, 80.0, 50.0, 2.0);
        first.temperatures = vec![21.5];
        first.mosfet_temperature = Some(30.0);
        let mut second = pack("b", 4, 100.0, 70.0, 4.0);
        second.temperatures = vec![40.0];
        second.mosfet_temperature = Some(45.0);
        let a = FakeBattery::ready(first);
        let b = FakeBattery::ready(second);
        b.set_available(false);
        let mut virtual_battery = VirtualBattery::new(
            vec![Box::new(a.clone()), Box::new(b.clone())],
            BatteryConfig::default(),
        )
        .unwrap();

        assert!(!virtual_battery.get_settings());
        assert!(!virtual_battery.refresh_data());
        assert!(!virtual_battery.is_warmed_up());

        b.set_available(true);
        assert!(virtual_battery.refresh_data());
        assert!(virtual_battery.is_warmed_up());
        assert_eq!(virtual_battery.get_current_snapshot().cell_count, 8);

        b.set_available(false);
        assert!(virtual_battery.refresh_data());
        let snapshot = virtual_battery.get_current_snapshot();
        assert_eq!(snapshot.cell_count, 4);
        assert_eq!(snapshot.current, 2.0);

        b.set_available(true);
        a.set_available(false);
        assert!(virtual_battery.refresh_data());
        let snapshot = virtual_battery.get_current_snapshot();
        assert_eq!(snapshot.cell_count, 4);
        assert_eq!(snapshot.current, 4.0);
        assert_eq!(snapshot.temperatures, vec![21.5]);
        assert_eq!(snapshot.mosfet_temperature, Some(30.0));

        b.set_available(false);
        assert!(!virtual_battery.refresh_data());
    }
}
