//! Named statements the store will run. Registered once at startup; call
//! sites only ever refer to a statement by name.

use std::collections::HashMap;

use crate::error::BoardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Returns rows.
    Query,
    /// Returns an affected-row count.
    Mutation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub name: &'static str,
    pub sql: &'static str,
    pub kind: StatementKind,
}

impl Statement {
    pub const fn query(name: &'static str, sql: &'static str) -> Self {
        Self {
            name,
            sql,
            kind: StatementKind::Query,
        }
    }

    pub const fn mutation(name: &'static str, sql: &'static str) -> Self {
        Self {
            name,
            sql,
            kind: StatementKind::Mutation,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct StatementCatalog {
    statements: HashMap<&'static str, Statement>,
}

impl StatementCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog, refusing duplicate or empty names.
    pub fn from_statements<I>(statements: I) -> Result<Self, BoardError>
    where
        I: IntoIterator<Item = Statement>,
    {
        let mut catalog = Self::new();
        for statement in statements {
            catalog.register(statement)?;
        }
        Ok(catalog)
    }

    pub fn register(&mut self, statement: Statement) -> Result<(), BoardError> {
        if statement.name.is_empty() || statement.sql.trim().is_empty() {
            return Err(BoardError::Unrecoverable(format!(
                "statement '{}' has an empty name or body",
                statement.name
            )));
        }
        if self.statements.contains_key(statement.name) {
            return Err(BoardError::Unrecoverable(format!(
                "statement '{}' registered twice",
                statement.name
            )));
        }
        self.statements.insert(statement.name, statement);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Statement> {
        self.statements.get(name)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
