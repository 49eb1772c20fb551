//! Canvas element, connector, patch, and state types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ConnectorId, ElementId, Point, Size};

/// Visual element category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementShape {
    /// Axis-aligned rectangle.
    Rectangle,
    /// Ellipse inscribed in the element bounds.
    Ellipse,
    /// Free text block.
    Text,
    /// Sticky note.
    Sticky,
    /// Grouping frame.
    Frame,
}

/// A single canvas element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Stable element identifier.
    pub id: ElementId,
    /// Element category.
    pub shape: ElementShape,
    /// Top-left corner.
    pub position: Point,
    /// Bounds.
    pub size: Size,
    /// Stacking order.
    pub z_index: i64,
    /// Optional text content.
    pub text: Option<String>,
    /// Optional fill colour.
    pub fill: Option<String>,
    /// Optional stroke colour.
    pub stroke: Option<String>,
    /// Locked elements ignore drag gestures.
    pub locked: bool,
}

/// A directed link between two elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    /// Stable connector identifier.
    pub id: ConnectorId,
    /// Source element.
    pub from: ElementId,
    /// Target element.
    pub to: ElementId,
    /// Optional label rendered along the connector.
    pub label: Option<String>,
}

/// Sparse patch where each `Some` field overwrites the element value.
///
/// `text`, `fill` and `stroke` are doubly optional: the outer `Some` means
/// "touch this field", the inner value is the replacement (which may clear it).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementPatch {
    /// Optional replacement for size.
    pub size: Option<Size>,
    /// Optional replacement for stacking order.
    pub z_index: Option<i64>,
    /// Optional replacement for text content.
    pub text: Option<Option<String>>,
    /// Optional replacement for fill colour.
    pub fill: Option<Option<String>>,
    /// Optional replacement for stroke colour.
    pub stroke: Option<Option<String>>,
    /// Optional replacement for the lock flag.
    pub locked: Option<bool>,
}

impl ElementPatch {
    /// Returns true when no fields are set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Captures an inverse patch for all fields present in `self`.
    pub fn capture_inverse_for(&self, el: &Element) -> Self {
        Self {
            size: self.size.map(|_| el.size),
            z_index: self.z_index.map(|_| el.z_index),
            text: self.text.as_ref().map(|_| el.text.clone()),
            fill: self.fill.as_ref().map(|_| el.fill.clone()),
            stroke: self.stroke.as_ref().map(|_| el.stroke.clone()),
            locked: self.locked.map(|_| el.locked),
        }
    }

    /// Applies this patch in place to `el`.
    pub fn apply_to(&self, el: &mut Element) {
        if let Some(v) = self.size {
            el.size = v;
        }
        if let Some(v) = self.z_index {
            el.z_index = v;
        }
        if let Some(v) = &self.text {
            el.text = v.clone();
        }
        if let Some(v) = &self.fill {
            el.fill = v.clone();
        }
        if let Some(v) = &self.stroke {
            el.stroke = v.clone();
        }
        if let Some(v) = self.locked {
            el.locked = v;
        }
    }
}

/// Materialized canvas: every live element and connector.
///
/// Ordered maps keep equality and serialization deterministic, which replay
/// relies on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanvasState {
    /// Elements keyed by id.
    pub elements: BTreeMap<ElementId, Element>,
    /// Connectors keyed by id.
    pub connectors: BTreeMap<ConnectorId, Connector>,
}

impl CanvasState {
    /// Creates an empty canvas.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an element.
    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    /// Looks up a connector.
    pub fn connector(&self, id: &str) -> Option<&Connector> {
        self.connectors.get(id)
    }

    /// Connectors attached to `element` on either end, in id order.
    pub fn connectors_for(&self, element: &str) -> Vec<&Connector> {
        self.connectors
            .values()
            .filter(|c| c.from == element || c.to == element)
            .collect()
    }
}
