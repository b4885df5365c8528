//! Reporte de diagnósticos.
//!
//! Cada fase del compilador produce errores de su propio dominio
//! (léxico, sintáctico, semántico). Todos se reportan de la misma
//! forma: una línea por error con la clase del error, la línea
//! de código fuente donde ocurrió y una descripción.

use crate::source::Located;
use std::{
    borrow::Cow,
    error::Error,
    fmt::{self, Display},
};

mod sealed {
    pub trait Sealed {}
}

/// Un error reportable con una línea de origen.
pub trait Report: sealed::Sealed {
    /// Clase propia del error, si no se debe usar la del conjunto.
    fn class(&self) -> Option<Cow<'_, str>> {
        None
    }

    /// Línea (base 1) donde ocurrió el error.
    fn line(&self) -> u32;

    /// Descripción legible del error.
    fn message(&self) -> String;
}

/// Conjunto de errores de un mismo dominio.
pub struct Diagnostics {
    kind: &'static str,
    errors: Vec<Box<dyn 'static + Report>>,
}

impl Diagnostics {
    /// Fija la clase por defecto de los errores de este conjunto.
    pub fn kind(self, kind: &'static str) -> Self {
        Diagnostics { kind, ..self }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Agrega un error al conjunto.
    pub fn push<E: 'static + Report>(&mut self, error: E) {
        self.errors.push(Box::new(error));
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics {
            kind: "error",
            errors: Default::default(),
        }
    }
}

impl<E: 'static + Report> From<E> for Diagnostics {
    fn from(error: E) -> Self {
        Diagnostics {
            errors: vec![Box::new(error)],
            ..Default::default()
        }
    }
}

impl<E: 'static + Report> From<Vec<E>> for Diagnostics {
    fn from(errors: Vec<E>) -> Self {
        let errors = errors
            .into_iter()
            .map(|error| {
                let error: Box<dyn Report> = Box::new(error);
                error
            })
            .collect();

        Diagnostics {
            errors,
            ..Default::default()
        }
    }
}

impl Display for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for error in &self.errors {
            let class = error.class().unwrap_or(Cow::Borrowed(self.kind));
            writeln!(
                fmt,
                "Error type {} at Line {}: {}",
                class,
                error.line(),
                error.message()
            )?;
        }

        Ok(())
    }
}

impl<E: Error> sealed::Sealed for Located<E> {}

impl<E: Error> Report for Located<E> {
    fn line(&self) -> u32 {
        Located::line(self)
    }

    fn message(&self) -> String {
        self.as_ref().to_string()
    }
}

impl sealed::Sealed for crate::semantic::SemanticError {}

impl Report for crate::semantic::SemanticError {
    fn class(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Owned(self.kind().ordinal().to_string()))
    }

    fn line(&self) -> u32 {
        self.line()
    }

    fn message(&self) -> String {
        self.kind().to_string()
    }
}
