//! Análisis sintáctico.
//!
//! El parser es descendente recursivo y produce un [`Ast`] cuyos nodos
//! llevan su ubicación original. Este árbol es la interfaz de entrada
//! para el análisis semántico ([`crate::semantic`]) y para la
//! construcción de IR ([`crate::lower`]), los cuales lo recorren de
//! forma independiente y sin modificarlo.

use std::{iter::Peekable, marker::PhantomData, rc::Rc};
use thiserror::Error;

use crate::{
    lex::{Identifier, Keyword, Token},
    source::{Located, Location},
};

/// Raíz del árbol: una unidad de compilación.
#[derive(Debug)]
pub struct Ast {
    pub units: Vec<Unit>,
}

/// Elemento de nivel global.
#[derive(Debug)]
pub enum Unit {
    Decl(Decl),
    Function(FunctionDef),
}

/// Declaración de constantes o variables, posiblemente múltiples.
#[derive(Debug)]
pub struct Decl {
    pub constant: bool,
    pub definitions: Vec<Definition>,
}

/// Un único símbolo declarado dentro de una [`Decl`].
#[derive(Debug)]
pub struct Definition {
    pub name: Located<Identifier>,
    pub dimensions: Vec<Located<Expr>>,
    pub init: Option<Initializer>,
}

/// Inicializador de una definición, junto a la ubicación de su `=`.
#[derive(Debug)]
pub struct Initializer {
    pub assign: Location,
    pub value: Located<InitVal>,
}

#[derive(Debug)]
pub enum InitVal {
    Expr(Located<Expr>),
    List(Vec<Located<InitVal>>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReturnType {
    Int,
    Void,
}

#[derive(Debug)]
pub struct FunctionDef {
    pub returns: ReturnType,
    pub name: Located<Identifier>,
    pub parameters: Vec<Parameter>,
    pub body: Block,
}

/// Parámetro formal.
///
/// Un parámetro arreglo se escribe `int a[]` o `int a[][N]...`. En ese
/// caso `array` incluye las dimensiones posteriores a la primera, la
/// cual nunca se especifica.
#[derive(Debug)]
pub struct Parameter {
    pub name: Located<Identifier>,
    pub array: Option<Vec<Located<Expr>>>,
}

#[derive(Debug)]
pub struct Block {
    pub items: Vec<BlockItem>,
}

#[derive(Debug)]
pub enum BlockItem {
    Decl(Decl),
    Stmt(Stmt),
}

#[derive(Debug)]
pub enum Stmt {
    Assign {
        target: Located<LVal>,
        assign: Location,
        value: Located<Expr>,
    },

    Expr(Option<Located<Expr>>),

    Block(Block),

    /// Cadena `if`, `else if`* y `else` opcional.
    If {
        branches: Vec<(Located<Cond>, Box<Stmt>)>,
        otherwise: Option<Box<Stmt>>,
    },

    While {
        condition: Located<Cond>,
        body: Box<Stmt>,
    },

    Break(Location),

    Continue(Location),

    Return {
        keyword: Location,
        value: Option<Located<Expr>>,
    },
}

/// Designador de una variable o elemento de arreglo.
#[derive(Debug)]
pub struct LVal {
    pub name: Located<Identifier>,
    pub indices: Vec<Located<Expr>>,
}

#[derive(Debug)]
pub enum Expr {
    /// Constante entera, con su texto original.
    Number(Rc<str>),

    LVal(LVal),

    Call {
        callee: Located<Identifier>,
        arguments: Vec<Located<Expr>>,
    },

    Unary(Located<UnaryOp>, Box<Located<Expr>>),

    Binary(Box<Located<Expr>>, BinOp, Box<Located<Expr>>),

    Paren(Box<Located<Expr>>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Condición de `if` o `while`.
#[derive(Debug)]
pub enum Cond {
    Expr(Located<Expr>),
    Compare(Box<Located<Cond>>, CmpOp, Box<Located<Cond>>),
    Logic(Box<Located<Cond>>, Logic, Box<Located<Cond>>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Logic {
    And,
    Or,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Expected {0}, found {1} instead")]
    UnexpectedToken(Token, Token),

    #[error("Expected {0}, none was found instead")]
    MissingToken(Token),

    #[error("Expected identifier")]
    ExpectedId,

    #[error("Expected `int` or `void`")]
    ExpectedType,

    #[error("Expected an expression")]
    ExpectedExpr,

    #[error("Abrupt end of program")]
    UnexpectedEof,
}

/// Construye el árbol sintáctico a partir de un flujo de tokens.
pub fn parse<'a, I>(tokens: I, start: Location) -> Result<Ast, Located<ParserError>>
where
    I: Iterator<Item = &'a Located<Token>> + Clone,
{
    let mut parser = Parser {
        tokens: tokens.peekable(),
        last_known: start,
        lifetime_hack: PhantomData,
    };

    parser.program().map_err(Failure::coerce)
}

#[derive(Clone)]
struct Parser<'a, I: Iterator<Item = &'a Located<Token>> + Clone> {
    tokens: Peekable<I>,
    last_known: Location,
    lifetime_hack: PhantomData<&'a ()>,
}

enum Failure {
    Weak(Located<ParserError>),
    Strict(Located<ParserError>),
}

impl Failure {
    fn weak(self) -> Self {
        Failure::Weak(self.coerce())
    }

    fn coerce(self) -> Located<ParserError> {
        match self {
            Failure::Weak(error) => error,
            Failure::Strict(error) => error,
        }
    }
}

type Parse<T> = Result<T, Failure>;

impl<'a, I> Parser<'a, I>
where
    I: Iterator<Item = &'a Located<Token>> + Clone,
{
    fn program(&mut self) -> Parse<Ast> {
        let mut units = Vec::new();
        while self.tokens.peek().is_some() {
            units.push(self.unit()?);
        }

        Ok(Ast { units })
    }

    fn unit(&mut self) -> Parse<Unit> {
        let is_function = self
            .lookahead(|s| {
                match s.next()?.into_inner() {
                    Token::Keyword(Keyword::Int) | Token::Keyword(Keyword::Void) => (),
                    _ => return s.fail(ParserError::ExpectedType),
                }

                s.id()?;
                s.expect(Token::OpenParen)
            })
            .is_ok();

        if is_function {
            self.function().map(Unit::Function)
        } else {
            self.decl().map(Unit::Decl)
        }
    }

    fn decl(&mut self) -> Parse<Decl> {
        let constant = self.accept(Token::Keyword(Keyword::Const))?;
        self.keyword(Keyword::Int)?;

        let mut definitions = vec![self.definition()?];
        while self.accept(Token::Comma)? {
            definitions.push(self.definition()?);
        }

        self.expect(Token::Semicolon)?;
        Ok(Decl {
            constant,
            definitions,
        })
    }

    fn definition(&mut self) -> Parse<Definition> {
        let name = self.id()?;
        let dimensions = self.subscripts()?;

        let init = if self.accept(Token::Assign)? {
            let assign = self.last_known.clone();
            let value = self.init_val()?;

            Some(Initializer { assign, value })
        } else {
            None
        };

        Ok(Definition {
            name,
            dimensions,
            init,
        })
    }

    fn init_val(&mut self) -> Parse<Located<InitVal>> {
        let start = self.peek_location();
        if !self.accept(Token::OpenCurly)? {
            let expr = self.expr()?;
            let location = expr.location().clone();

            return Ok(Located::at(InitVal::Expr(expr), location));
        }

        let mut items = Vec::new();
        if !self.accept(Token::CloseCurly)? {
            items.push(self.init_val()?);
            while self.accept(Token::Comma)? {
                items.push(self.init_val()?);
            }

            self.expect(Token::CloseCurly)?;
        }

        Ok(self.located(start, InitVal::List(items)))
    }

    fn function(&mut self) -> Parse<FunctionDef> {
        let returns = match self.next()?.into_inner() {
            Token::Keyword(Keyword::Int) => ReturnType::Int,
            Token::Keyword(Keyword::Void) => ReturnType::Void,
            _ => self.fail(ParserError::ExpectedType)?,
        };

        let name = self.id()?;
        self.expect(Token::OpenParen)?;

        let mut parameters = Vec::new();
        if !self.accept(Token::CloseParen)? {
            parameters.push(self.parameter()?);
            while self.accept(Token::Comma)? {
                parameters.push(self.parameter()?);
            }

            self.expect(Token::CloseParen)?;
        }

        let body = self.block()?;
        Ok(FunctionDef {
            returns,
            name,
            parameters,
            body,
        })
    }

    fn parameter(&mut self) -> Parse<Parameter> {
        self.keyword(Keyword::Int)?;
        let name = self.id()?;

        let array = if self.accept(Token::OpenSquare)? {
            self.expect(Token::CloseSquare)?;
            Some(self.subscripts()?)
        } else {
            None
        };

        Ok(Parameter { name, array })
    }

    fn block(&mut self) -> Parse<Block> {
        self.expect(Token::OpenCurly)?;

        let mut items = Vec::new();
        while !self.accept(Token::CloseCurly)? {
            let item = match self.peek() {
                Some(Token::Keyword(Keyword::Const)) | Some(Token::Keyword(Keyword::Int)) => {
                    BlockItem::Decl(self.decl()?)
                }

                _ => BlockItem::Stmt(self.statement()?),
            };

            items.push(item);
        }

        Ok(Block { items })
    }

    fn statement(&mut self) -> Parse<Stmt> {
        match self.peek() {
            Some(Token::OpenCurly) => self.block().map(Stmt::Block),
            Some(Token::Keyword(Keyword::If)) => self.if_statement(),
            Some(Token::Keyword(Keyword::While)) => self.while_statement(),

            Some(Token::Keyword(Keyword::Break)) => {
                self.next()?;
                let location = self.last_known.clone();
                self.expect(Token::Semicolon)?;

                Ok(Stmt::Break(location))
            }

            Some(Token::Keyword(Keyword::Continue)) => {
                self.next()?;
                let location = self.last_known.clone();
                self.expect(Token::Semicolon)?;

                Ok(Stmt::Continue(location))
            }

            Some(Token::Keyword(Keyword::Return)) => {
                self.next()?;
                let keyword = self.last_known.clone();

                let value = match self.peek() {
                    Some(Token::Semicolon) => None,
                    _ => Some(self.expr()?),
                };

                self.expect(Token::Semicolon)?;
                Ok(Stmt::Return { keyword, value })
            }

            Some(Token::Id(_)) => {
                let assignment = self.attempt(|s| {
                    let target = s.lval()?;
                    s.expect(Token::Assign).map_err(Failure::weak)?;

                    Ok((target, s.last_known.clone()))
                });

                match assignment {
                    Ok((target, assign)) => {
                        let value = self.expr()?;
                        self.expect(Token::Semicolon)?;

                        Ok(Stmt::Assign {
                            target,
                            assign,
                            value,
                        })
                    }

                    Err(_) => self.expr_statement(),
                }
            }

            _ => self.expr_statement(),
        }
    }

    fn expr_statement(&mut self) -> Parse<Stmt> {
        if self.accept(Token::Semicolon)? {
            return Ok(Stmt::Expr(None));
        }

        let expr = self.expr()?;
        self.expect(Token::Semicolon)?;

        Ok(Stmt::Expr(Some(expr)))
    }

    fn if_statement(&mut self) -> Parse<Stmt> {
        let mut branches = vec![self.guarded(Keyword::If)?];
        let mut otherwise = None;

        while self.accept(Token::Keyword(Keyword::Else))? {
            if let Some(Token::Keyword(Keyword::If)) = self.peek() {
                branches.push(self.guarded(Keyword::If)?);
            } else {
                otherwise = Some(Box::new(self.statement()?));
                break;
            }
        }

        Ok(Stmt::If {
            branches,
            otherwise,
        })
    }

    fn while_statement(&mut self) -> Parse<Stmt> {
        let (condition, body) = self.guarded(Keyword::While)?;
        Ok(Stmt::While { condition, body })
    }

    /// `keyword ( cond ) stmt`
    fn guarded(&mut self, keyword: Keyword) -> Parse<(Located<Cond>, Box<Stmt>)> {
        self.keyword(keyword)?;
        self.expect(Token::OpenParen)?;
        let condition = self.cond()?;
        self.expect(Token::CloseParen)?;

        let body = Box::new(self.statement()?);
        Ok((condition, body))
    }

    fn lval(&mut self) -> Parse<Located<LVal>> {
        let name = self.id()?;
        let start = name.location().clone();
        let indices = self.subscripts()?;

        Ok(self.located(start, LVal { name, indices }))
    }

    /// Secuencia posiblemente vacía de `[expr]`.
    fn subscripts(&mut self) -> Parse<Vec<Located<Expr>>> {
        let mut subscripts = Vec::new();
        while self.accept(Token::OpenSquare)? {
            subscripts.push(self.expr()?);
            self.expect(Token::CloseSquare)?;
        }

        Ok(subscripts)
    }

    fn cond(&mut self) -> Parse<Located<Cond>> {
        self.logic(Logic::Or)
    }

    fn logic(&mut self, logic: Logic) -> Parse<Located<Cond>> {
        let (token, operand): (_, fn(&mut Self) -> Parse<Located<Cond>>) = match logic {
            Logic::Or => (Token::Or, |s| s.logic(Logic::And)),
            Logic::And => (Token::And, Self::equality),
        };

        let mut lhs = operand(self)?;
        while self.accept(token.clone())? {
            let rhs = operand(self)?;
            let location = Location::span(lhs.location().clone(), rhs.location());

            lhs = Located::at(Cond::Logic(Box::new(lhs), logic, Box::new(rhs)), location);
        }

        Ok(lhs)
    }

    fn equality(&mut self) -> Parse<Located<Cond>> {
        self.comparison_chain(Self::relational, |token| match token {
            Token::Equal => Some(CmpOp::Equal),
            Token::NotEqual => Some(CmpOp::NotEqual),
            _ => None,
        })
    }

    fn relational(&mut self) -> Parse<Located<Cond>> {
        self.comparison_chain(
            |s| {
                let expr = s.expr()?;
                let location = expr.location().clone();

                Ok(Located::at(Cond::Expr(expr), location))
            },
            |token| match token {
                Token::Less => Some(CmpOp::Less),
                Token::Greater => Some(CmpOp::Greater),
                Token::LessOrEqual => Some(CmpOp::LessOrEqual),
                Token::GreaterOrEqual => Some(CmpOp::GreaterOrEqual),
                _ => None,
            },
        )
    }

    fn comparison_chain<F, O>(&mut self, mut operand: F, operator: O) -> Parse<Located<Cond>>
    where
        F: FnMut(&mut Self) -> Parse<Located<Cond>>,
        O: Fn(&Token) -> Option<CmpOp>,
    {
        let mut lhs = operand(self)?;
        while let Some(op) = self.peek().and_then(&operator) {
            self.next()?;

            let rhs = operand(self)?;
            let location = Location::span(lhs.location().clone(), rhs.location());

            lhs = Located::at(Cond::Compare(Box::new(lhs), op, Box::new(rhs)), location);
        }

        Ok(lhs)
    }

    fn expr(&mut self) -> Parse<Located<Expr>> {
        self.binary_chain(Self::term, |token| match token {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            _ => None,
        })
    }

    fn term(&mut self) -> Parse<Located<Expr>> {
        self.binary_chain(Self::unary, |token| match token {
            Token::Times => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            Token::Percent => Some(BinOp::Mod),
            _ => None,
        })
    }

    fn binary_chain<F, O>(&mut self, operand: F, operator: O) -> Parse<Located<Expr>>
    where
        F: Fn(&mut Self) -> Parse<Located<Expr>>,
        O: Fn(&Token) -> Option<BinOp>,
    {
        let mut lhs = operand(self)?;
        while let Some(op) = self.peek().and_then(&operator) {
            self.next()?;

            let rhs = operand(self)?;
            let location = Location::span(lhs.location().clone(), rhs.location());

            lhs = Located::at(Expr::Binary(Box::new(lhs), op, Box::new(rhs)), location);
        }

        Ok(lhs)
    }

    fn unary(&mut self) -> Parse<Located<Expr>> {
        let op = match self.peek() {
            Some(Token::Plus) => UnaryOp::Plus,
            Some(Token::Minus) => UnaryOp::Minus,
            Some(Token::Not) => UnaryOp::Not,
            _ => return self.primary(),
        };

        self.next()?;
        let start = self.last_known.clone();
        let op = Located::at(op, start.clone());

        let operand = self.unary()?;
        Ok(self.located(start, Expr::Unary(op, Box::new(operand))))
    }

    fn primary(&mut self) -> Parse<Located<Expr>> {
        let start = self.peek_location();

        match self.peek() {
            Some(Token::OpenParen) => {
                self.next()?;
                let inner = self.expr()?;
                self.expect(Token::CloseParen)?;

                Ok(self.located(start, Expr::Paren(Box::new(inner))))
            }

            Some(Token::IntLiteral(literal)) => {
                let literal = Rc::clone(literal);
                self.next()?;

                Ok(self.located(start, Expr::Number(literal)))
            }

            Some(Token::Id(_)) => {
                let is_call = self
                    .lookahead(|s| {
                        s.id()?;
                        s.expect(Token::OpenParen)
                    })
                    .is_ok();

                if !is_call {
                    return self.lval().map(|lval| lval.map(Expr::LVal));
                }

                let callee = self.id()?;
                self.expect(Token::OpenParen)?;

                let mut arguments = Vec::new();
                if !self.accept(Token::CloseParen)? {
                    arguments.push(self.expr()?);
                    while self.accept(Token::Comma)? {
                        arguments.push(self.expr()?);
                    }

                    self.expect(Token::CloseParen)?;
                }

                Ok(self.located(start, Expr::Call { callee, arguments }))
            }

            _ => {
                self.next()?;
                self.fail(ParserError::ExpectedExpr)
            }
        }
    }

    fn attempt<T, F>(&mut self, rule: F) -> Parse<T>
    where
        F: FnOnce(&mut Self) -> Parse<T>,
    {
        let mut fork = self.clone();

        let result = rule(&mut fork);
        if result.is_ok() {
            *self = fork;
        }

        result
    }

    fn lookahead<T, F>(&mut self, rule: F) -> Parse<T>
    where
        F: FnOnce(&mut Self) -> Parse<T>,
    {
        rule(&mut self.clone())
    }

    fn located<T>(&self, start: Location, value: T) -> Located<T> {
        Located::at(value, Location::span(start, &self.last_known))
    }

    fn peek(&mut self) -> Option<&'a Token> {
        let token: &'a Located<Token> = *self.tokens.peek()?;
        Some(token.val())
    }

    fn peek_location(&mut self) -> Location {
        match self.tokens.peek() {
            Some(token) => token.location().clone(),
            None => self.last_known.clone(),
        }
    }

    /// Consume el siguiente token solo si es el esperado.
    fn accept(&mut self, token: Token) -> Parse<bool> {
        if self.peek() == Some(&token) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn id(&mut self) -> Parse<Located<Identifier>> {
        let (location, token) = self.next()?.split();
        match token {
            Token::Id(id) => Ok(Located::at(id, location)),
            _ => self.fail(ParserError::ExpectedId),
        }
    }

    fn keyword(&mut self, keyword: Keyword) -> Parse<()> {
        self.expect(Token::Keyword(keyword))
    }

    fn expect(&mut self, token: Token) -> Parse<()> {
        match self.next().map(Located::into_inner) {
            Ok(found) if found == token => Ok(()),
            Ok(found) => self.fail(ParserError::UnexpectedToken(token, found)),
            Err(_) => self.fail(ParserError::MissingToken(token)),
        }
    }

    fn next(&mut self) -> Parse<Located<Token>> {
        match self.tokens.next() {
            Some(token) => {
                self.last_known = token.location().clone();
                Ok(token.clone())
            }

            None => self.fail(ParserError::UnexpectedEof),
        }
    }

    fn fail<T>(&self, error: ParserError) -> Parse<T> {
        Err(Failure::Strict(Located::at(error, self.last_known.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lex::Lexer, source};

    fn parse_str(text: &str) -> Result<Ast, Located<ParserError>> {
        let (start, chars) = source::consume_str(text, "test");
        let tokens = Lexer::new(start.clone(), chars)
            .try_exhaustive()
            .expect("lexer error");

        parse(tokens.iter(), start)
    }

    #[test]
    fn distinguishes_functions_from_declarations() {
        let ast = parse_str("int a = 1, b[2][3]; const int c = 4; int f(int x, int y[][3]) { return x; }")
            .unwrap();

        assert_eq!(ast.units.len(), 3);
        match &ast.units[0] {
            Unit::Decl(decl) => {
                assert!(!decl.constant);
                assert_eq!(decl.definitions.len(), 2);
                assert_eq!(decl.definitions[1].dimensions.len(), 2);
            }

            _ => panic!("expected declaration"),
        }

        match &ast.units[2] {
            Unit::Function(function) => {
                assert_eq!(function.returns, ReturnType::Int);
                assert!(function.parameters[0].array.is_none());
                assert_eq!(function.parameters[1].array.as_ref().map(Vec::len), Some(1));
            }

            _ => panic!("expected function"),
        }
    }

    #[test]
    fn backtracks_from_assignment_to_expression() {
        let ast = parse_str("void f() { a[1] = 2; g(3); a; }").unwrap();
        let body = match &ast.units[0] {
            Unit::Function(function) => &function.body,
            _ => panic!("expected function"),
        };

        assert!(matches!(body.items[0], BlockItem::Stmt(Stmt::Assign { .. })));
        assert!(matches!(body.items[1], BlockItem::Stmt(Stmt::Expr(Some(_)))));
        assert!(matches!(body.items[2], BlockItem::Stmt(Stmt::Expr(Some(_)))));
    }

    #[test]
    fn collects_else_if_chains() {
        let ast = parse_str("void f() { if (a) ; else if (b) ; else if (c) ; else ; }").unwrap();
        let body = match &ast.units[0] {
            Unit::Function(function) => &function.body,
            _ => panic!("expected function"),
        };

        match &body.items[0] {
            BlockItem::Stmt(Stmt::If {
                branches,
                otherwise,
            }) => {
                assert_eq!(branches.len(), 3);
                assert!(otherwise.is_some());
            }

            _ => panic!("expected if"),
        }
    }

    #[test]
    fn binds_conditions_by_precedence() {
        let ast = parse_str("void f() { while (a < 1 || b == 2 && c) ; }").unwrap();
        let body = match &ast.units[0] {
            Unit::Function(function) => &function.body,
            _ => panic!("expected function"),
        };

        let condition = match &body.items[0] {
            BlockItem::Stmt(Stmt::While { condition, .. }) => condition,
            _ => panic!("expected while"),
        };

        match condition.val() {
            Cond::Logic(lhs, Logic::Or, rhs) => {
                assert!(matches!(lhs.val(), Cond::Compare(_, CmpOp::Less, _)));
                assert!(matches!(rhs.val(), Cond::Logic(_, Logic::And, _)));
            }

            _ => panic!("expected `||` at the root"),
        }
    }

    #[test]
    fn reports_line_of_syntax_errors() {
        let error = parse_str("int main() {\n  return 1\n}").unwrap_err();
        assert_eq!(error.line(), 3);
        assert!(matches!(error.val(), ParserError::UnexpectedToken(Token::Semicolon, _)));
    }
}
