//! Detalles específicos de la arquitectura objetivo.
//!
//! La asignación de registros en [`crate::codegen`] es agnóstica a la
//! arquitectura y solo conoce el archivo de registros por medio del
//! trait [`Register`]. La selección de instrucciones, el marco de pila
//! y la convención de llamada se implementan en [`riscv`].

use std::fmt::{Debug, Display};

pub mod riscv;

/// Registro de procesador.
pub trait Register: 'static + Copy + Eq + Debug + Display {
    /// Registros disponibles para asignación, en orden de preferencia.
    const FILE: &'static [Self];

    /// Registro en el que se retornan valores.
    const RETURN: Self;
}
