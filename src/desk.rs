use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::engine::EngineError;

/// A named service channel. Each desk owns at most one external calendar.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeskId {
    Language,
    Study,
    Partnerships,
    Business,
}

impl DeskId {
    pub fn display_name(self) -> &'static str {
        match self {
            DeskId::Language => "Language",
            DeskId::Study => "Study",
            DeskId::Partnerships => "Partnerships",
            DeskId::Business => "Business",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Desk {
    pub id: DeskId,
    /// External calendar id. `None` means the desk is permanently in fallback mode.
    pub calendar: Option<String>,
}

impl Desk {
    pub fn is_live(&self) -> bool {
        self.calendar.is_some()
    }
}

/// Static desk configuration, owned by the deployment.
#[derive(Debug, Clone, Default)]
pub struct DeskRegistry {
    desks: HashMap<DeskId, Desk>,
}

impl DeskRegistry {
    /// Every known desk is registered; only those in `calendars` get a live integration.
    pub fn new(calendars: HashMap<DeskId, String>) -> Self {
        let desks = DeskId::iter()
            .map(|id| {
                let calendar = calendars.get(&id).filter(|c| !c.trim().is_empty()).cloned();
                (id, Desk { id, calendar })
            })
            .collect();
        Self { desks }
    }

    pub fn resolve(&self, desk: &str) -> Result<&Desk, EngineError> {
        let id: DeskId = desk
            .parse()
            .map_err(|_| EngineError::DeskNotFound(desk.to_string()))?;
        self.get(id)
    }

    pub fn get(&self, id: DeskId) -> Result<&Desk, EngineError> {
        self.desks
            .get(&id)
            .ok_or_else(|| EngineError::DeskNotFound(id.to_string()))
    }

    pub fn live_count(&self) -> usize {
        self.desks.values().filter(|d| d.is_live()).count()
    }
}
