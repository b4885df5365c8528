//! Análisis semántico.
//!
//! El verificador recorre el árbol una única vez, de arriba hacia
//! abajo, poblando la arena de ámbitos e infiriendo tipos. Cada
//! nodo verifica primero sus hijos y luego sus propias reglas, por lo
//! que los errores se detectan en el mismo orden en que aparecen las
//! subexpresiones.
//!
//! Solo se reporta un error por línea: cualquier error detectado en la
//! misma línea que el error más reciente se descarta.

use log::debug;
use thiserror::Error;

use crate::{
    parse::{
        Ast, Block, BlockItem, Cond, Decl, Definition, Expr, FunctionDef, InitVal, LVal,
        Parameter, ReturnType, Stmt, Unit,
    },
    scope::{AlreadyDeclared, ScopeId, Scopes, Type},
    source::Located,
};

/// Clase de un error semántico. El ordinal reportado es la posición
/// de la variante, contando desde 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("Variable not declared")]
    VarNotDeclared,

    #[error("Function not defined")]
    FuncNotDefined,

    #[error("Variable redeclared")]
    VarRedeclared,

    #[error("Function redefined")]
    FuncRedefined,

    #[error("Type mismatched for assignment")]
    AssignMismatch,

    #[error("Type mismatched for operands")]
    OperatorMismatch,

    #[error("Type mismatched for return")]
    ReturnMismatch,

    #[error("Function is not applicable for arguments")]
    ArgumentMismatch,

    #[error("Not an array")]
    IndexMismatch,

    #[error("Not a function")]
    VarUsedAsFunc,

    #[error("The left-hand side of an assignment must be a variable")]
    InvalidAssignTarget,
}

impl ErrorKind {
    pub fn ordinal(self) -> u32 {
        self as u32 + 1
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}")]
pub struct SemanticError {
    kind: ErrorKind,
    line: u32,
}

impl SemanticError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl Ast {
    /// Verifica la semántica estática del programa completo.
    ///
    /// Se retornan todos los errores detectados en orden de detección.
    pub fn check(&self) -> Result<(), Vec<SemanticError>> {
        debug!("checking {} top-level units", self.units.len());

        let scopes = Scopes::new();
        let mut checker = Checker {
            current: scopes.global(),
            scopes,
            returns: Type::Void,
            last: None,
            errors: Vec::new(),
        };

        for unit in &self.units {
            match unit {
                Unit::Decl(decl) => checker.decl(decl),
                Unit::Function(function) => checker.function(function),
            }
        }

        debug!("semantic analysis found {} errors", checker.errors.len());
        if checker.errors.is_empty() {
            Ok(())
        } else {
            Err(checker.errors)
        }
    }
}

struct Checker {
    scopes: Scopes,
    current: ScopeId,
    returns: Type,
    last: Option<(u32, ErrorKind)>,
    errors: Vec<SemanticError>,
}

impl Checker {
    fn report(&mut self, kind: ErrorKind, line: u32) {
        if let Some((last, first)) = self.last {
            if last == line {
                debug!("line {}: {:?} covered by {:?}", line, kind, first);
                return;
            }
        }

        debug!("line {}: {:?}", line, kind);

        self.last = Some((line, kind));
        self.errors.push(SemanticError { kind, line });
    }

    fn lookup(&self, name: &str) -> Option<&Type> {
        self.scopes.lookup(self.current, name)
    }

    /// Abre un ámbito anidado en el actual.
    fn enter(&mut self) {
        self.current = self.scopes.open(self.current);
    }

    /// Regresa al ámbito que contiene al actual.
    fn leave(&mut self) {
        if let Some(parent) = self.scopes.parent(self.current) {
            self.current = parent;
        }
    }

    fn decl(&mut self, decl: &Decl) {
        for definition in &decl.definitions {
            self.definition(definition);
        }
    }

    fn definition(&mut self, definition: &Definition) {
        let name = &definition.name;
        let declared = Type::array_of(Type::Basic, definition.dimensions.len());

        // Tras un error del inicializador el símbolo conserva su tipo declarado
        let declaration = self
            .scopes
            .declare(self.current, name.as_ref().clone(), declared.clone());

        if let Err(AlreadyDeclared(_)) = declaration {
            self.report(ErrorKind::VarRedeclared, name.line());
            return;
        }

        for dimension in &definition.dimensions {
            self.expr(dimension);
        }

        if let Some(init) = &definition.init {
            self.init_val(&init.value);

            let compatible = match self.init_type(&init.value) {
                Some(init) => declared.matches(&init) || (declared.is_array() && init.is_array()),
                None => false,
            };

            if !compatible {
                self.report(ErrorKind::AssignMismatch, init.assign.start().line());
            }
        }
    }

    fn init_val(&mut self, init: &Located<InitVal>) {
        match init.as_ref() {
            InitVal::Expr(expr) => self.expr(expr),
            InitVal::List(items) => {
                for item in items {
                    self.init_val(item);
                }
            }
        }
    }

    fn init_type(&self, init: &Located<InitVal>) -> Option<Type> {
        match init.as_ref() {
            InitVal::Expr(expr) => self.expr_type(expr),
            InitVal::List(_) => Some(Type::array_of(Type::Basic, 1)),
        }
    }

    fn function(&mut self, function: &FunctionDef) {
        let returns = match function.returns {
            ReturnType::Int => Type::Basic,
            ReturnType::Void => Type::Void,
        };

        let parameters = function.parameters.iter().map(parameter_type).collect();
        let signature = Type::Function(Box::new(returns.clone()), parameters);

        // Debe declararse antes del cuerpo para permitir recursión
        let name = &function.name;
        let declaration = self
            .scopes
            .declare(self.current, name.as_ref().clone(), signature);

        if let Err(AlreadyDeclared(_)) = declaration {
            self.report(ErrorKind::FuncRedefined, name.line());
            return;
        }

        self.enter();
        for parameter in &function.parameters {
            self.parameter(parameter);
        }

        self.returns = returns;
        self.block(&function.body);
        self.leave();
    }

    fn parameter(&mut self, parameter: &Parameter) {
        let name = &parameter.name;
        let declaration = self
            .scopes
            .declare(self.current, name.as_ref().clone(), parameter_type(parameter));

        if let Err(AlreadyDeclared(_)) = declaration {
            self.report(ErrorKind::VarRedeclared, name.line());
            return;
        }

        for dimension in parameter.array.iter().flatten() {
            self.expr(dimension);
        }
    }

    fn block(&mut self, block: &Block) {
        self.enter();

        for item in &block.items {
            match item {
                BlockItem::Decl(decl) => self.decl(decl),
                BlockItem::Stmt(stmt) => self.statement(stmt),
            }
        }

        self.leave();
    }

    fn statement(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign {
                target,
                assign,
                value,
            } => {
                let line = assign.start().line();
                let name = target.as_ref().name.as_ref();

                if let Some(Type::Function(..)) = self.lookup(name.as_ref()) {
                    self.report(ErrorKind::InvalidAssignTarget, line);
                    return;
                }

                self.lval(target.as_ref());
                self.expr(value);

                let compatible = match (self.lval_type(target.as_ref()), self.expr_type(value)) {
                    (Some(l), Some(r)) => l.matches(&r),
                    _ => false,
                };

                if !compatible {
                    self.report(ErrorKind::AssignMismatch, line);
                }
            }

            Stmt::Expr(Some(expr)) => self.expr(expr),
            Stmt::Expr(None) => (),
            Stmt::Block(block) => self.block(block),

            Stmt::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    self.cond(condition);
                    self.statement(body);
                }

                if let Some(otherwise) = otherwise {
                    self.statement(otherwise);
                }
            }

            Stmt::While { condition, body } => {
                self.cond(condition);
                self.statement(body);
            }

            Stmt::Break(_) | Stmt::Continue(_) => (),

            Stmt::Return { keyword, value } => match value {
                None => {
                    if self.returns != Type::Void {
                        self.report(ErrorKind::ReturnMismatch, keyword.start().line());
                    }
                }

                Some(value) => {
                    self.expr(value);

                    let compatible = match self.expr_type(value) {
                        Some(typ) => self.returns.matches(&typ),
                        None => false,
                    };

                    if !compatible {
                        self.report(ErrorKind::ReturnMismatch, value.line());
                    }
                }
            },
        }
    }

    fn cond(&mut self, cond: &Located<Cond>) {
        match cond.as_ref() {
            Cond::Expr(expr) => self.expr(expr),
            Cond::Compare(lhs, _, rhs) | Cond::Logic(lhs, _, rhs) => {
                self.cond(lhs);
                self.cond(rhs);
            }
        }

        if !matches!(self.cond_type(cond), Some(Type::Basic)) {
            self.report(ErrorKind::OperatorMismatch, cond.line());
        }
    }

    fn lval(&mut self, lval: &LVal) {
        let line = lval.name.line();
        if self.lookup(lval.name.as_ref().as_ref()).is_none() {
            self.report(ErrorKind::VarNotDeclared, line);
            return;
        } else if self.lval_type(lval).is_none() {
            self.report(ErrorKind::IndexMismatch, line);
            return;
        }

        for index in &lval.indices {
            self.expr(index);
        }
    }

    fn expr(&mut self, expr: &Located<Expr>) {
        match expr.as_ref() {
            Expr::Number(_) => (),
            Expr::LVal(lval) => self.lval(lval),
            Expr::Paren(inner) => self.expr(inner),

            Expr::Call { callee, arguments } => {
                let parameters = match self.lookup(callee.as_ref().as_ref()) {
                    Some(Type::Function(_, parameters)) => parameters.clone(),

                    Some(_) => {
                        self.report(ErrorKind::VarUsedAsFunc, callee.line());
                        return;
                    }

                    None => {
                        self.report(ErrorKind::FuncNotDefined, callee.line());
                        return;
                    }
                };

                for argument in arguments {
                    self.expr(argument);
                }

                let line = arguments.first().unwrap_or(expr).line();
                let applicable = parameters.len() == arguments.len()
                    && parameters.iter().zip(arguments).all(|(parameter, argument)| {
                        matches!(self.expr_type(argument), Some(typ) if parameter.matches(&typ))
                    });

                if !applicable {
                    self.report(ErrorKind::ArgumentMismatch, line);
                }
            }

            Expr::Unary(op, operand) => {
                self.expr(operand);

                if !matches!(self.expr_type(operand), Some(Type::Basic)) {
                    self.report(ErrorKind::OperatorMismatch, op.line());
                }
            }

            Expr::Binary(lhs, _, rhs) => {
                self.expr(lhs);
                self.expr(rhs);

                let basic = |typ: Option<Type>| matches!(typ, Some(Type::Basic));
                if !basic(self.expr_type(lhs)) || !basic(self.expr_type(rhs)) {
                    self.report(ErrorKind::OperatorMismatch, expr.line());
                }
            }
        }
    }

    /// Tipo de una expresión, o `None` si es inválida.
    fn expr_type(&self, expr: &Located<Expr>) -> Option<Type> {
        match expr.as_ref() {
            Expr::Number(_) => Some(Type::Basic),
            Expr::LVal(lval) => self.lval_type(lval),
            Expr::Paren(inner) => self.expr_type(inner),

            Expr::Call { callee, .. } => match self.lookup(callee.as_ref().as_ref()) {
                Some(Type::Function(returns, _)) if returns.is_basic() => Some(Type::Basic),
                _ => None,
            },

            Expr::Unary(_, operand) => self.expr_type(operand).filter(Type::is_basic),

            Expr::Binary(lhs, _, rhs) => {
                let lhs = self.expr_type(lhs)?;
                let rhs = self.expr_type(rhs)?;

                Some(lhs).filter(|lhs| lhs.matches(&rhs))
            }
        }
    }

    fn cond_type(&self, cond: &Located<Cond>) -> Option<Type> {
        match cond.as_ref() {
            Cond::Expr(expr) => self.expr_type(expr),
            Cond::Compare(lhs, _, rhs) | Cond::Logic(lhs, _, rhs) => {
                let lhs = self.cond_type(lhs)?;
                let rhs = self.cond_type(rhs)?;

                Some(lhs).filter(|lhs| lhs.matches(&rhs))
            }
        }
    }

    /// Se remueve un `Array` por subíndice. Sobre un escalar o con
    /// subíndices de más el resultado es `None`. Un nombre de función
    /// conserva su tipo para que el uso se reporte más adelante.
    fn lval_type(&self, lval: &LVal) -> Option<Type> {
        let typ = self.lookup(lval.name.as_ref().as_ref())?;
        if let Type::Function(..) = typ {
            return Some(typ.clone());
        }

        lval.indices
            .iter()
            .try_fold(typ, |typ, _| typ.element())
            .cloned()
    }
}

/// Un parámetro `a[]` o `a[][n]` tiene una dimensión más que las
/// indicadas explícitamente.
fn parameter_type(parameter: &Parameter) -> Type {
    match &parameter.array {
        None => Type::Basic,
        Some(dimensions) => Type::array_of(Type::Basic, 1 + dimensions.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_start_at_one() {
        assert_eq!(ErrorKind::VarNotDeclared.ordinal(), 1);
        assert_eq!(ErrorKind::AssignMismatch.ordinal(), 5);
        assert_eq!(ErrorKind::InvalidAssignTarget.ordinal(), 11);
    }

    #[test]
    fn reports_once_per_line() {
        let scopes = Scopes::new();
        let mut checker = Checker {
            current: scopes.global(),
            scopes,
            returns: Type::Void,
            last: None,
            errors: Vec::new(),
        };

        checker.report(ErrorKind::VarNotDeclared, 3);
        checker.report(ErrorKind::AssignMismatch, 3);
        checker.report(ErrorKind::VarNotDeclared, 3);
        checker.report(ErrorKind::AssignMismatch, 4);

        let reported: Vec<_> = checker
            .errors
            .iter()
            .map(|error| (error.kind(), error.line()))
            .collect();

        assert_eq!(
            reported,
            [
                (ErrorKind::VarNotDeclared, 3),
                (ErrorKind::AssignMismatch, 4)
            ]
        );
    }
}
