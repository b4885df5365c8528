//! Tipos y tabla de símbolos.
//!
//! Los ámbitos se almacenan en una arena y cada uno referencia a su
//! padre por índice. La búsqueda de un nombre recorre la cadena de
//! padres hacia afuera, mientras que la redeclaración solo se verifica
//! contra el ámbito actual.

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use thiserror::Error;

use crate::lex::Identifier;

/// Tipo de una expresión o símbolo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Type {
    Void,
    Basic,
    Array(Box<Type>),
    Function(Box<Type>, Vec<Type>),
}

impl Type {
    /// Envuelve `element` en un `Array` por cada dimensión.
    pub fn array_of(element: Type, dimensions: usize) -> Type {
        (0..dimensions).fold(element, |typ, _| Type::Array(Box::new(typ)))
    }

    /// Compatibilidad estructural, sin conversiones implícitas.
    pub fn matches(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Void, Type::Void) | (Type::Basic, Type::Basic) => true,
            (Type::Array(a), Type::Array(b)) => a.matches(b),

            (Type::Function(a_ret, a_params), Type::Function(b_ret, b_params)) => {
                a_ret.matches(b_ret)
                    && a_params.len() == b_params.len()
                    && a_params.iter().zip(b_params).all(|(a, b)| a.matches(b))
            }

            _ => false,
        }
    }

    pub fn is_basic(&self) -> bool {
        matches!(self, Type::Basic)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array(_))
    }

    /// Tipo resultante de indexar una vez.
    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Array(element) => Some(element),
            _ => None,
        }
    }
}

impl Display for Type {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => fmt.write_str("void"),
            Type::Basic => fmt.write_str("int"),
            Type::Array(element) => write!(fmt, "{}[]", element),

            Type::Function(returns, parameters) => {
                write!(fmt, "{}(", returns)?;
                for (i, parameter) in parameters.iter().enumerate() {
                    if i > 0 {
                        fmt.write_str(", ")?;
                    }

                    write!(fmt, "{}", parameter)?;
                }

                fmt.write_str(")")
            }
        }
    }
}

/// Índice de un ámbito dentro de [`Scopes`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScopeId(usize);

#[derive(Error, Debug)]
#[error("`{0}` is already declared in this scope")]
pub struct AlreadyDeclared(pub Identifier);

/// Arena de ámbitos.
pub struct Scopes {
    scopes: Vec<Scope>,
}

struct Scope {
    parent: Option<ScopeId>,
    symbols: HashMap<Identifier, Type>,
}

impl Scopes {
    /// Crea una arena con únicamente el ámbito global.
    pub fn new() -> Self {
        Scopes {
            scopes: vec![Scope {
                parent: None,
                symbols: HashMap::new(),
            }],
        }
    }

    pub fn global(&self) -> ScopeId {
        ScopeId(0)
    }

    /// Abre un ámbito hijo de `parent`.
    pub fn open(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(Scope {
            parent: Some(parent),
            symbols: HashMap::new(),
        });

        ScopeId(self.scopes.len() - 1)
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes[scope.0].parent
    }

    /// Busca un nombre desde `scope` hacia afuera.
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<&Type> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = &self.scopes[id.0];
            if let Some(typ) = scope.symbols.get(name) {
                return Some(typ);
            }

            current = scope.parent;
        }

        None
    }

    /// Declara un nombre en `scope`. Falla si `scope` ya lo contiene,
    /// sin importar lo declarado en ámbitos externos.
    pub fn declare(
        &mut self,
        scope: ScopeId,
        name: Identifier,
        typ: Type,
    ) -> Result<(), AlreadyDeclared> {
        let scope = &mut self.scopes[scope.0];
        if scope.symbols.contains_key(&name) {
            return Err(AlreadyDeclared(name));
        }

        scope.symbols.insert(name, typ);
        Ok(())
    }
}

impl Default for Scopes {
    fn default() -> Self {
        Scopes::new()
    }
}
