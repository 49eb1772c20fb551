//! Reference reducer over [`CanvasState`].

use crate::{
    canvas::CanvasState,
    op::{OpKind, Operation},
};

use super::traits::Reducer;

/// Applies canvas operations to a [`CanvasState`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CanvasReducer;

impl Reducer for CanvasReducer {
    type State = CanvasState;

    fn apply(&self, state: &mut Self::State, op: &Operation) {
        match &op.kind {
            OpKind::CreateElement { element } => {
                state.elements.insert(element.id.clone(), element.clone());
            }
            OpKind::MoveElement { id, to } => {
                if let Some(el) = state.elements.get_mut(id) {
                    el.position = *to;
                }
            }
            OpKind::UpdateElement { id, patch } => {
                if let Some(el) = state.elements.get_mut(id) {
                    patch.apply_to(el);
                }
            }
            OpKind::DeleteElement { id } => {
                state.elements.remove(id);
            }
            OpKind::CreateConnector { connector } => {
                state
                    .connectors
                    .insert(connector.id.clone(), connector.clone());
            }
            OpKind::DeleteConnector { id } => {
                state.connectors.remove(id);
            }
        }
    }

    fn invert(&self, before: &Self::State, kind: &OpKind) -> Option<OpKind> {
        match kind {
            OpKind::CreateElement { element } => match before.element(&element.id) {
                // Creating over an existing id replaced it; restore the old one.
                Some(prev) => Some(OpKind::CreateElement {
                    element: prev.clone(),
                }),
                None => Some(OpKind::DeleteElement {
                    id: element.id.clone(),
                }),
            },
            OpKind::MoveElement { id, .. } => before.element(id).map(|el| OpKind::MoveElement {
                id: id.clone(),
                to: el.position,
            }),
            OpKind::UpdateElement { id, patch } => {
                before.element(id).map(|el| OpKind::UpdateElement {
                    id: id.clone(),
                    patch: patch.capture_inverse_for(el),
                })
            }
            OpKind::DeleteElement { id } => before.element(id).map(|el| OpKind::CreateElement {
                element: el.clone(),
            }),
            OpKind::CreateConnector { connector } => match before.connector(&connector.id) {
                Some(prev) => Some(OpKind::CreateConnector {
                    connector: prev.clone(),
                }),
                None => Some(OpKind::DeleteConnector {
                    id: connector.id.clone(),
                }),
            },
            OpKind::DeleteConnector { id } => {
                before
                    .connector(id)
                    .map(|c| OpKind::CreateConnector { connector: c.clone() })
            }
        }
    }
}
