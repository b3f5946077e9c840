//! Worklists: the plates to process and the task lists they go through.
//!
//! A worklist is produced by an external parser (or by hand in tests and the demo) and is
//! read-only to the scheduler.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::PlateTask;

/// A physical plate named by the worklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plate {
    /// Barcode printed on the plate
    pub barcode: String,
    /// Labware definition name
    pub labware: String,
}

impl Plate {
    /// Create a plate record.
    pub fn new(barcode: impl Into<String>, labware: impl Into<String>) -> Self {
        Self {
            barcode: barcode.into(),
            labware: labware.into(),
        }
    }
}

/// One liquid transfer between a source and a destination plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    /// Source plate barcode
    pub source_plate: String,
    /// Destination plate barcode
    pub destination_plate: String,
    /// Transfer volume in microlitres
    #[serde(default)]
    pub volume_ul: f64,
}

/// Task lists run before and after the hitpick step, per plate role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLists {
    /// Tasks for source plates before hitpicking
    #[serde(default)]
    pub source_prehitpick: Vec<PlateTask>,
    /// Tasks for source plates after hitpicking
    #[serde(default)]
    pub source_posthitpick: Vec<PlateTask>,
    /// Tasks for destination plates before hitpicking
    #[serde(default)]
    pub destination_prehitpick: Vec<PlateTask>,
    /// Tasks for destination plates after hitpicking
    #[serde(default)]
    pub destination_posthitpick: Vec<PlateTask>,
}

/// Role a plate plays in a worklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlateRole {
    /// Liquid is drawn from the plate
    Source,
    /// Liquid is dispensed into the plate
    Destination,
}

impl std::fmt::Display for PlateRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlateRole::Source => write!(f, "source"),
            PlateRole::Destination => write!(f, "destination"),
        }
    }
}

/// Ordered plan of source and destination plates and the transfers between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worklist {
    /// Unique id, generated when absent
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Human readable name
    pub name: String,
    /// Source plates in processing order
    #[serde(default)]
    pub source_plates: Vec<Plate>,
    /// Destination plates in processing order
    #[serde(default)]
    pub destination_plates: Vec<Plate>,
    /// Transfers the worklist fulfills
    #[serde(default)]
    pub transfers: Vec<Transfer>,
    /// Per-role task lists
    #[serde(default)]
    pub tasks: TaskLists,
    /// Device type that performs the hitpick step
    #[serde(default = "default_hitpick_device_type")]
    pub hitpick_device_type: String,
    /// Storage device that receives finished destination plates
    #[serde(default)]
    pub plate_storage_device: Option<String>,
}

fn default_hitpick_device_type() -> String {
    "Hitpicker".to_string()
}

impl Worklist {
    /// Create an empty worklist.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source_plates: Vec::new(),
            destination_plates: Vec::new(),
            transfers: Vec::new(),
            tasks: TaskLists::default(),
            hitpick_device_type: default_hitpick_device_type(),
            plate_storage_device: None,
        }
    }

    /// Plates listed for `role`.
    pub fn plates(&self, role: PlateRole) -> &[Plate] {
        match role {
            PlateRole::Source => &self.source_plates,
            PlateRole::Destination => &self.destination_plates,
        }
    }

    /// Number of distinct plates of `role` that take part in a transfer.
    pub fn plate_count(&self, role: PlateRole) -> usize {
        self.transfers
            .iter()
            .map(|t| match role {
                PlateRole::Source => t.source_plate.as_str(),
                PlateRole::Destination => t.destination_plate.as_str(),
            })
            .collect::<HashSet<_>>()
            .len()
    }

    /// Full to-do list for a plate of `role`: pre-hitpick tasks, the hitpick, post-hitpick tasks.
    ///
    /// Destination plates that are loaded into a dock are told which storage device to use.
    pub fn todo_list(&self, role: PlateRole) -> Vec<PlateTask> {
        let (pre, hitpick, post) = match role {
            PlateRole::Source => (
                &self.tasks.source_prehitpick,
                "source_hitpick",
                &self.tasks.source_posthitpick,
            ),
            PlateRole::Destination => (
                &self.tasks.destination_prehitpick,
                "dest_hitpick",
                &self.tasks.destination_posthitpick,
            ),
        };

        let mut todo: Vec<PlateTask> = pre.clone();
        todo.push(PlateTask::new(&self.hitpick_device_type, hitpick));
        todo.extend(post.iter().cloned());

        if role == PlateRole::Destination {
            if let Some(storage) = &self.plate_storage_device {
                if let Some(load) = todo.iter_mut().find(|t| t.is("Dock", "Load")) {
                    load.parameters
                        .push(super::task::Parameter::new("device_instance", storage));
                }
            }
        }
        todo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(src: &str, dst: &str) -> Transfer {
        Transfer {
            source_plate: src.into(),
            destination_plate: dst.into(),
            volume_ul: 1.0,
        }
    }

    #[test]
    fn test_plate_count_is_distinct() {
        let mut worklist = Worklist::new("count");
        worklist.transfers = vec![
            transfer("S1", "D1"),
            transfer("S1", "D2"),
            transfer("S2", "D1"),
        ];
        assert_eq!(worklist.plate_count(PlateRole::Source), 2);
        assert_eq!(worklist.plate_count(PlateRole::Destination), 2);
    }

    #[test]
    fn test_todo_list_wraps_hitpick() {
        let mut worklist = Worklist::new("todo");
        worklist.tasks.source_prehitpick = vec![PlateTask::new("Stacker", "Downstack")];
        worklist.tasks.source_posthitpick = vec![PlateTask::new("Trash", "Discard")];

        let todo = worklist.todo_list(PlateRole::Source);
        let names: Vec<String> = todo.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            ["Stacker:Downstack", "Hitpicker:source_hitpick", "Trash:Discard"]
        );
    }

    #[test]
    fn test_dock_load_gets_storage_device() {
        let mut worklist = Worklist::new("dock");
        worklist.plate_storage_device = Some("Hive".into());
        worklist.tasks.destination_posthitpick = vec![PlateTask::new("Dock", "Load")];

        let todo = worklist.todo_list(PlateRole::Destination);
        assert_eq!(todo[0].command, "dest_hitpick");
        assert_eq!(todo[1].parameter("device_instance"), Some("Hive"));
        // source plates are untouched
        assert!(worklist.todo_list(PlateRole::Source)[0].parameters.is_empty());
    }

    #[test]
    fn test_deserialize_minimal_worklist() {
        let worklist: Worklist = serde_json::from_str(r#"{"name":"empty"}"#).expect("valid json");
        assert_eq!(worklist.hitpick_device_type, "Hitpicker");
        assert_eq!(worklist.plate_count(PlateRole::Source), 0);
    }
}
