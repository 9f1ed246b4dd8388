//! Read facades over a branch.
//!
//! [`Item`], [`List`] and [`Reduce`] compose branch reads into the views a
//! rendering layer consumes. Callers re-read after every repository or
//! branch update.

use std::sync::Arc;

use serde_json::Value;

use crate::branch::{Branch, ItemView};
use crate::codec::Id;
use crate::error::CacheError;
use crate::types::{Attributes, Entity, Ref, Relationships};

/// Edit handle passed to [`Item::render`].
#[derive(Debug, Clone, Copy)]
pub struct ItemInteract<'a> {
    branch: &'a Branch,
    model: &'a str,
    id: Option<&'a Id>,
}

impl ItemInteract<'_> {
    pub fn commit_attributes(&self, attributes: Attributes) -> Result<(), CacheError> {
        self.branch.commit_attributes(self.model, self.id, attributes)
    }

    pub fn commit_relationships(&self, relationships: Relationships) -> Result<(), CacheError> {
        self.branch
            .commit_relationships(self.model, self.id, relationships)
    }
}

/// A single item bound to a branch.
///
/// With no id bound, reads return an empty view and edits fail with
/// [`CacheError::Unbound`].
#[derive(Debug, Clone)]
pub struct Item {
    branch: Arc<Branch>,
    model: String,
    id: Option<Id>,
}

impl Item {
    pub fn new(branch: Arc<Branch>, model: impl Into<String>, id: Option<Id>) -> Self {
        Self {
            branch,
            model: model.into(),
            id,
        }
    }

    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    pub fn read(&self) -> Result<ItemView, CacheError> {
        match &self.id {
            Some(id) => self.branch.get_item(&self.model, id),
            None => Ok(ItemView {
                is_loading: false,
                item: None,
            }),
        }
    }

    /// Read, then hand the view and an edit handle to `render`.
    pub fn render<T>(
        &self,
        render: impl FnOnce(&ItemView, ItemInteract<'_>) -> T,
    ) -> Result<T, CacheError> {
        let view = self.read()?;
        Ok(render(&view, self.interact()))
    }

    pub fn interact(&self) -> ItemInteract<'_> {
        ItemInteract {
            branch: &self.branch,
            model: &self.model,
            id: self.id.as_ref(),
        }
    }

    pub fn commit_attributes(&self, attributes: Attributes) -> Result<(), CacheError> {
        self.interact().commit_attributes(attributes)
    }

    pub fn commit_relationships(&self, relationships: Relationships) -> Result<(), CacheError> {
        self.interact().commit_relationships(relationships)
    }
}

/// View produced by [`List::read`].
#[derive(Debug, Clone, PartialEq)]
pub struct ListState {
    pub is_loading: bool,
    /// No query is bound.
    pub is_empty: bool,
    pub items: Vec<Ref>,
    pub total_count: u64,
}

/// A list query bound to a branch. A `None` query never fetches.
#[derive(Debug, Clone)]
pub struct List {
    branch: Arc<Branch>,
    model: String,
    query: Option<Value>,
}

impl List {
    pub fn new(branch: Arc<Branch>, model: impl Into<String>, query: Option<Value>) -> Self {
        Self {
            branch,
            model: model.into(),
            query,
        }
    }

    pub fn read(&self) -> Result<ListState, CacheError> {
        let Some(query) = &self.query else {
            return Ok(ListState {
                is_loading: false,
                is_empty: true,
                items: Vec::new(),
                total_count: 0,
            });
        };
        let view = self.branch.get_list(&self.model, query)?;
        Ok(ListState {
            is_loading: view.is_loading,
            is_empty: false,
            items: view.items,
            total_count: view.total_count,
        })
    }

    pub fn render<T>(&self, render: impl FnOnce(&ListState) -> T) -> Result<T, CacheError> {
        let state = self.read()?;
        Ok(render(&state))
    }
}

/// Result of [`Reduce::fold`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceView<A> {
    /// The list or any of its items is still loading.
    pub is_loading: bool,
    /// No query is bound.
    pub is_empty: bool,
    pub accumulator: A,
}

/// Folds over the resolved items of a list.
#[derive(Debug, Clone)]
pub struct Reduce {
    branch: Arc<Branch>,
    model: String,
    query: Option<Value>,
}

impl Reduce {
    pub fn new(branch: Arc<Branch>, model: impl Into<String>, query: Option<Value>) -> Self {
        Self {
            branch,
            model: model.into(),
            query,
        }
    }

    /// Fold `callback(accumulator, item, index)` over every item that has
    /// resolved, with `index` being the item's position in the list.
    ///
    /// Items still loading are skipped and mark the view loading. Item reads
    /// go through the branch, so unresolved items start fetching.
    pub fn fold<A>(
        &self,
        initial: A,
        mut callback: impl FnMut(A, &Entity, usize) -> A,
    ) -> Result<ReduceView<A>, CacheError> {
        let Some(query) = &self.query else {
            return Ok(ReduceView {
                is_loading: false,
                is_empty: true,
                accumulator: initial,
            });
        };

        let list = self.branch.get_list(&self.model, query)?;
        let mut is_loading = list.is_loading;
        let mut accumulator = initial;
        for (index, item) in list.items.iter().enumerate() {
            let view = self.branch.get_item(&item.model, &item.id)?;
            is_loading |= view.is_loading;
            if let Some(entity) = &view.item {
                accumulator = callback(accumulator, entity, index);
            }
        }

        Ok(ReduceView {
            is_loading,
            is_empty: false,
            accumulator,
        })
    }

    pub fn render<A, T>(
        &self,
        initial: A,
        callback: impl FnMut(A, &Entity, usize) -> A,
        render: impl FnOnce(&ReduceView<A>) -> T,
    ) -> Result<T, CacheError> {
        let view = self.fold(initial, callback)?;
        Ok(render(&view))
    }
}
