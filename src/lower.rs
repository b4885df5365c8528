//! Construcción de IR.
//!
//! Este recorrido es independiente del análisis semántico y asume un
//! programa ya verificado. Cada función se construye bloque a bloque:
//! el constructor mantiene un bloque actual, nunca terminado, al cual
//! se agregan instrucciones. Al emitir una instrucción terminal que no
//! es seguida por un bloque conocido (`break`, `continue`, `return`),
//! el constructor continúa en un bloque nuevo e inalcanzable, de forma
//! que todo bloque termine en exactamente una instrucción terminal.
//!
//! El orden de emisión de los bloques es el orden en que el
//! constructor se posiciona sobre ellos.

use std::{collections::HashMap, rc::Rc};

use log::{debug, trace};
use thiserror::Error;

use crate::{
    ir::{
        BinOp, Block, CmpOp, Function, Global, Instruction, Label, Local, Module, Op, Signature,
        Value,
    },
    lex::{self, Identifier, LexerError},
    parse::{
        self, Ast, Cond, Decl, Expr, FunctionDef, InitVal, LVal, Logic, ReturnType, Stmt, Unit,
    },
    source::Located,
};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LowerError {
    #[error("Expression is not a compile-time constant")]
    NotConstant,

    #[error("Division by zero in constant expression")]
    DivisionByZero,

    #[error("Invalid array dimension `{0}`")]
    BadDimension(i64),

    #[error("Symbol `{0}` is undefined")]
    Undefined(Identifier),

    #[error(transparent)]
    Literal(#[from] LexerError),
}

pub type Lower<T> = Result<T, Located<LowerError>>;

impl Ast {
    /// Traduce un programa verificado a IR.
    pub fn lower(&self) -> Lower<Module> {
        let mut context = Context {
            globals: Vec::new(),
            signatures: HashMap::new(),
            scopes: vec![HashMap::new()],
        };

        let mut functions = Vec::new();
        for unit in &self.units {
            match unit {
                Unit::Decl(decl) => context.global_decl(decl)?,
                Unit::Function(function) => functions.push(context.function(function)?),
            }
        }

        Ok(Module {
            globals: context.globals,
            functions,
        })
    }
}

/// Una variable en la tabla de valores.
#[derive(Clone)]
enum Symbol {
    Scalar {
        pointer: Value,
        constant: Option<i32>,
    },

    Array {
        base: Base,
        dimensions: Vec<u32>,
        constant: Option<Rc<[i32]>>,
    },
}

/// Origen de la dirección base de un arreglo.
#[derive(Clone)]
enum Base {
    Address(Value),

    /// Parámetro: la dirección está almacenada en este espacio.
    Pointer(Value),
}

struct Context {
    globals: Vec<Rc<Global>>,
    signatures: HashMap<Identifier, Rc<Signature>>,
    scopes: Vec<HashMap<Identifier, Symbol>>,
}

impl Context {
    fn lookup(&self, name: &Located<Identifier>) -> Lower<&Symbol> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name.as_ref()))
            .ok_or_else(|| {
                Located::at(
                    LowerError::Undefined(name.as_ref().clone()),
                    name.location().clone(),
                )
            })
    }

    fn declare(&mut self, name: &Located<Identifier>, symbol: Symbol) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.as_ref().clone(), symbol);
        }
    }

    fn global_decl(&mut self, decl: &Decl) -> Lower<()> {
        for definition in &decl.definitions {
            let dimensions = self.dimensions(&definition.dimensions)?;
            let words = words(&dimensions, &definition.name)?;

            let init = match &definition.init {
                None => vec![0; words as usize],
                Some(init) => flatten(&init.value, &dimensions)
                    .into_iter()
                    .map(|item| item.map_or(Ok(0), |expr| self.eval_const(expr)))
                    .collect::<Lower<Vec<_>>>()?,
            };

            let global = Rc::new(Global {
                name: definition.name.as_ref().to_string(),
                init,
            });

            self.globals.push(Rc::clone(&global));

            let pointer = Value::Global(Rc::clone(&global));
            let symbol = if dimensions.is_empty() {
                Symbol::Scalar {
                    pointer,
                    constant: decl.constant.then(|| global.init[0]),
                }
            } else {
                Symbol::Array {
                    base: Base::Address(pointer),
                    dimensions,
                    constant: decl.constant.then(|| Rc::from(global.init.as_slice())),
                }
            };

            self.declare(&definition.name, symbol);
        }

        Ok(())
    }

    fn dimensions(&self, dimensions: &[Located<Expr>]) -> Lower<Vec<u32>> {
        dimensions
            .iter()
            .map(|dimension| match self.eval_const(dimension)? {
                size if size > 0 => Ok(size as u32),
                size => Err(Located::at(
                    LowerError::BadDimension(size.into()),
                    dimension.location().clone(),
                )),
            })
            .collect()
    }

    /// Evalúa una expresión constante.
    fn eval_const(&self, expr: &Located<Expr>) -> Lower<i32> {
        let fail = |error| Err(Located::at(error, expr.location().clone()));

        match expr.as_ref() {
            Expr::Number(literal) => lex::decode_int(literal)
                .map_err(|error| Located::at(error.into(), expr.location().clone())),

            Expr::Paren(inner) => self.eval_const(inner),

            Expr::Unary(op, operand) => {
                let operand = self.eval_const(operand)?;
                Ok(match op.as_ref() {
                    parse::UnaryOp::Plus => operand,
                    parse::UnaryOp::Minus => operand.wrapping_neg(),
                    parse::UnaryOp::Not => (operand == 0) as i32,
                })
            }

            Expr::Binary(lhs, op, rhs) => {
                let (lhs, rhs) = (self.eval_const(lhs)?, self.eval_const(rhs)?);
                match op {
                    parse::BinOp::Add => Ok(lhs.wrapping_add(rhs)),
                    parse::BinOp::Sub => Ok(lhs.wrapping_sub(rhs)),
                    parse::BinOp::Mul => Ok(lhs.wrapping_mul(rhs)),
                    _ if rhs == 0 => fail(LowerError::DivisionByZero),
                    parse::BinOp::Div => Ok(lhs.wrapping_div(rhs)),
                    parse::BinOp::Mod => Ok(lhs.wrapping_rem(rhs)),
                }
            }

            Expr::LVal(lval) => match self.lookup(&lval.name)? {
                Symbol::Scalar {
                    constant: Some(value),
                    ..
                } if lval.indices.is_empty() => Ok(*value),

                Symbol::Array {
                    dimensions,
                    constant: Some(values),
                    ..
                } if lval.indices.len() == dimensions.len() => {
                    let mut offset = 0usize;
                    for (index, &size) in lval.indices.iter().zip(dimensions) {
                        let index = self.eval_const(index)?;
                        if index < 0 || index as u32 >= size {
                            return fail(LowerError::NotConstant);
                        }

                        offset = offset * size as usize + index as usize;
                    }

                    Ok(values[offset])
                }

                _ => fail(LowerError::NotConstant),
            },

            Expr::Call { .. } => fail(LowerError::NotConstant),
        }
    }

    fn function(&mut self, definition: &FunctionDef) -> Lower<Function> {
        let name = definition.name.as_ref();
        debug!("lowering function `{}`", name);

        let signature = Rc::new(Signature {
            name: Rc::from(name.as_ref()),
            void: definition.returns == ReturnType::Void,
            parameters: definition.parameters.len() as u32,
        });

        // Se registra antes del cuerpo para permitir recursión
        self.signatures.insert(name.clone(), Rc::clone(&signature));

        let mut builder = Builder {
            context: self,
            blocks: Vec::new(),
            layout: Vec::new(),
            current: Label(0),
            locals: 0,
            loops: Vec::new(),
        };

        let entry = builder.new_block("entry");
        builder.position(entry);

        builder.context.scopes.push(HashMap::new());
        let result = builder.body(definition);
        builder.context.scopes.pop();
        result?;

        if signature.void {
            builder.terminate(Op::RetVoid);
        } else {
            builder.terminate(Op::Ret(Value::Const(0)));
        }

        trace!(
            "function `{}`: {} blocks, {} locals",
            name,
            builder.blocks.len(),
            builder.locals
        );

        Ok(Function {
            signature,
            blocks: builder.blocks,
            layout: builder.layout,
            locals: builder.locals,
        })
    }
}

/// Destinos de `continue` y `break` de un ciclo.
struct Loop {
    cond: Label,
    next: Label,
}

struct Builder<'a> {
    context: &'a mut Context,
    blocks: Vec<Block>,
    layout: Vec<Label>,
    current: Label,
    locals: u32,
    loops: Vec<Loop>,
}

impl Builder<'_> {
    fn body(&mut self, definition: &FunctionDef) -> Lower<()> {
        for (i, parameter) in definition.parameters.iter().enumerate() {
            let slot = self.push(Op::Alloca);
            self.push_void(Op::Store {
                value: Value::Argument(i as u32),
                target: slot.clone(),
            });

            let symbol = match &parameter.array {
                None => Symbol::Scalar {
                    pointer: slot,
                    constant: None,
                },

                Some(dimensions) => {
                    // La primera dimensión no participa en el cálculo de direcciones
                    let mut sizes = vec![0];
                    sizes.extend(self.context.dimensions(dimensions)?);

                    Symbol::Array {
                        base: Base::Pointer(slot),
                        dimensions: sizes,
                        constant: None,
                    }
                }
            };

            self.context.declare(&parameter.name, symbol);
        }

        self.block(&definition.body)
    }

    fn block(&mut self, block: &parse::Block) -> Lower<()> {
        self.context.scopes.push(HashMap::new());

        let result = block.items.iter().try_for_each(|item| match item {
            parse::BlockItem::Decl(decl) => self.local_decl(decl),
            parse::BlockItem::Stmt(stmt) => self.statement(stmt),
        });

        self.context.scopes.pop();
        result
    }

    fn local_decl(&mut self, decl: &Decl) -> Lower<()> {
        for definition in &decl.definitions {
            let dimensions = self.context.dimensions(&definition.dimensions)?;
            let items = match &definition.init {
                Some(init) => Some(flatten(&init.value, &dimensions)),
                None => None,
            };

            let constants = match (&items, decl.constant) {
                (Some(items), true) => Some(
                    items
                        .iter()
                        .map(|item| item.map_or(Ok(0), |expr| self.context.eval_const(expr)))
                        .collect::<Lower<Vec<_>>>()?,
                ),

                _ => None,
            };

            // El nombre ya es visible dentro de su propio inicializador
            if dimensions.is_empty() {
                let slot = self.push(Op::Alloca);
                let constant = constants.as_ref().map(|constants| constants[0]);

                let symbol = Symbol::Scalar {
                    pointer: slot.clone(),
                    constant,
                };

                self.context.declare(&definition.name, symbol);

                let value = match (constant, &items) {
                    (Some(constant), _) => Value::Const(constant),
                    (None, Some(items)) => match items[0] {
                        Some(expr) => self.expr(expr)?,
                        None => Value::Const(0),
                    },

                    (None, None) => Value::Const(0),
                };

                self.push_void(Op::Store {
                    value,
                    target: slot,
                });
            } else {
                let words = words(&dimensions, &definition.name)?;
                let base = self.push(Op::ArrayAlloca(words));

                let symbol = Symbol::Array {
                    base: Base::Address(base.clone()),
                    dimensions,
                    constant: constants.clone().map(Rc::from),
                };

                self.context.declare(&definition.name, symbol);

                if let Some(items) = items {
                    for (i, item) in items.into_iter().enumerate() {
                        let value = match (&constants, item) {
                            (Some(constants), _) => Value::Const(constants[i]),
                            (None, Some(expr)) => self.expr(expr)?,
                            (None, None) => Value::Const(0),
                        };

                        let target = self.push(Op::ElementPtr {
                            base: base.clone(),
                            offset: Value::Const(i as i32),
                        });

                        self.push_void(Op::Store { value, target });
                    }
                }
            }
        }

        Ok(())
    }

    fn statement(&mut self, stmt: &Stmt) -> Lower<()> {
        match stmt {
            Stmt::Assign { target, value, .. } => {
                let value = self.expr(value)?;
                let (target, _) = self.address(target.as_ref())?;
                self.push_void(Op::Store { value, target });
            }

            Stmt::Expr(Some(expr)) => {
                self.expr(expr)?;
            }

            Stmt::Expr(None) => (),

            Stmt::Block(block) => self.block(block)?,

            Stmt::If {
                branches,
                otherwise,
            } => {
                let join = self.new_block("if_end");
                for (condition, body) in branches {
                    let then = self.new_block("if_true");
                    let otherwise = self.new_block("if_false");

                    let condition = self.truth(condition)?;
                    self.terminate(Op::Branch {
                        condition,
                        then,
                        otherwise,
                    });

                    self.position(then);
                    self.statement(body)?;
                    self.terminate(Op::Jump(join));

                    self.position(otherwise);
                }

                if let Some(otherwise) = otherwise {
                    self.statement(otherwise)?;
                }

                self.terminate(Op::Jump(join));
                self.position(join);
            }

            Stmt::While { condition, body } => {
                let cond = self.new_block("while_cond");
                let then = self.new_block("while_body");
                let next = self.new_block("while_next");

                self.terminate(Op::Jump(cond));
                self.position(cond);

                let condition = self.truth(condition)?;
                self.terminate(Op::Branch {
                    condition,
                    then,
                    otherwise: next,
                });

                self.position(then);
                self.loops.push(Loop { cond, next });
                let result = self.statement(body);
                self.loops.pop();
                result?;

                self.terminate(Op::Jump(cond));
                self.position(next);
            }

            Stmt::Break(_) => {
                if let Some(target) = self.loops.last().map(|l| l.next) {
                    self.dead_end(Op::Jump(target));
                }
            }

            Stmt::Continue(_) => {
                if let Some(target) = self.loops.last().map(|l| l.cond) {
                    self.dead_end(Op::Jump(target));
                }
            }

            Stmt::Return { value, .. } => {
                let op = match value {
                    Some(value) => Op::Ret(self.expr(value)?),
                    None => Op::RetVoid,
                };

                self.dead_end(op);
            }
        }

        Ok(())
    }

    /// Evalúa una condición como booleano de un bit.
    fn truth(&mut self, cond: &Located<Cond>) -> Lower<Value> {
        let value = self.cond(cond)?;
        Ok(self.push(Op::Compare(CmpOp::Ne, value, Value::Const(0))))
    }

    fn cond(&mut self, cond: &Located<Cond>) -> Lower<Value> {
        match cond.as_ref() {
            Cond::Expr(expr) => self.expr(expr),

            Cond::Compare(lhs, op, rhs) => {
                let lhs = self.cond(lhs)?;
                let rhs = self.cond(rhs)?;

                let op = match op {
                    parse::CmpOp::Equal => CmpOp::Eq,
                    parse::CmpOp::NotEqual => CmpOp::Ne,
                    parse::CmpOp::Less => CmpOp::Lt,
                    parse::CmpOp::Greater => CmpOp::Gt,
                    parse::CmpOp::LessOrEqual => CmpOp::Le,
                    parse::CmpOp::GreaterOrEqual => CmpOp::Ge,
                };

                let compare = self.push(Op::Compare(op, lhs, rhs));
                Ok(self.push(Op::ZExt(compare)))
            }

            Cond::Logic(lhs, logic, rhs) => {
                let left = self.truth(lhs)?;
                let left_edge = self.current;

                let rhs_block = self.new_block("cond_rhs");
                let phi_block = self.new_block("cond_phi");

                let (then, otherwise) = match logic {
                    Logic::And => (rhs_block, phi_block),
                    Logic::Or => (phi_block, rhs_block),
                };

                self.terminate(Op::Branch {
                    condition: left.clone(),
                    then,
                    otherwise,
                });

                self.position(rhs_block);
                let right = self.truth(rhs)?;
                let right_edge = self.current;
                self.terminate(Op::Jump(phi_block));

                self.position(phi_block);
                let phi = self.push(Op::Phi([(left, left_edge), (right, right_edge)]));
                Ok(self.push(Op::ZExt(phi)))
            }
        }
    }

    fn expr(&mut self, expr: &Located<Expr>) -> Lower<Value> {
        match expr.as_ref() {
            Expr::Number(literal) => lex::decode_int(literal)
                .map(Value::Const)
                .map_err(|error| Located::at(error.into(), expr.location().clone())),

            Expr::Paren(inner) => self.expr(inner),

            Expr::LVal(lval) => {
                let (address, element) = self.address(lval)?;
                if element {
                    Ok(self.push(Op::Load(address)))
                } else {
                    Ok(address)
                }
            }

            Expr::Unary(op, operand) => {
                let operand = self.expr(operand)?;
                match op.as_ref() {
                    parse::UnaryOp::Plus => Ok(operand),
                    parse::UnaryOp::Minus => {
                        Ok(self.push(Op::Binary(BinOp::Sub, Value::Const(0), operand)))
                    }

                    parse::UnaryOp::Not => {
                        let zero = self.push(Op::Compare(CmpOp::Eq, operand, Value::Const(0)));
                        Ok(self.push(Op::ZExt(zero)))
                    }
                }
            }

            Expr::Binary(lhs, op, rhs) => {
                let lhs = self.expr(lhs)?;
                let rhs = self.expr(rhs)?;

                let op = match op {
                    parse::BinOp::Add => BinOp::Add,
                    parse::BinOp::Sub => BinOp::Sub,
                    parse::BinOp::Mul => BinOp::Mul,
                    parse::BinOp::Div => BinOp::Div,
                    parse::BinOp::Mod => BinOp::Rem,
                };

                Ok(self.push(Op::Binary(op, lhs, rhs)))
            }

            Expr::Call { callee, arguments } => {
                let target = self
                    .context
                    .signatures
                    .get(callee.as_ref())
                    .cloned()
                    .ok_or_else(|| {
                        Located::at(
                            LowerError::Undefined(callee.as_ref().clone()),
                            callee.location().clone(),
                        )
                    })?;

                let arguments = arguments
                    .iter()
                    .map(|argument| self.expr(argument))
                    .collect::<Lower<Vec<_>>>()?;

                let void = target.void;
                let call = Op::Call { target, arguments };

                if void {
                    // El valor de una llamada `void` nunca se lee en un programa válido
                    self.push_void(call);
                    Ok(Value::Const(0))
                } else {
                    Ok(self.push(call))
                }
            }
        }
    }

    /// Calcula la dirección designada por un lvalue. El booleano indica
    /// si la dirección es de un escalar (`true`) o de un subarreglo.
    fn address(&mut self, lval: &LVal) -> Lower<(Value, bool)> {
        let symbol = self.context.lookup(&lval.name)?.clone();

        let (base, dimensions) = match symbol {
            Symbol::Scalar { pointer, .. } => return Ok((pointer, true)),

            Symbol::Array {
                base, dimensions, ..
            } => {
                let base = match base {
                    Base::Address(address) => address,
                    Base::Pointer(slot) => self.push(Op::Load(slot)),
                };

                (base, dimensions)
            }
        };

        let mut indices = lval.indices.iter();
        let mut offset = match indices.next() {
            Some(index) => self.expr(index)?,
            None => return Ok((base, false)),
        };

        for (index, &size) in indices.zip(&dimensions[1..]) {
            let scaled = self.push(Op::Binary(BinOp::Mul, offset, Value::Const(size as i32)));
            let index = self.expr(index)?;
            offset = self.push(Op::Binary(BinOp::Add, scaled, index));
        }

        let rest = &dimensions[lval.indices.len().min(dimensions.len())..];
        if !rest.is_empty() {
            let stride = rest.iter().product::<u32>();
            offset = self.push(Op::Binary(BinOp::Mul, offset, Value::Const(stride as i32)));
        }

        let address = self.push(Op::ElementPtr { base, offset });
        Ok((address, rest.is_empty()))
    }

    fn new_block(&mut self, name: &'static str) -> Label {
        self.blocks.push(Block {
            name,
            instructions: Vec::new(),
        });

        Label(self.blocks.len() as u32 - 1)
    }

    fn position(&mut self, label: Label) {
        self.layout.push(label);
        self.current = label;
    }

    fn push(&mut self, op: Op) -> Value {
        let local = Local(self.locals);
        self.locals += 1;

        self.append(Instruction {
            output: Some(local),
            op,
        });

        Value::Local(local)
    }

    fn push_void(&mut self, op: Op) {
        self.append(Instruction { output: None, op });
    }

    fn terminate(&mut self, op: Op) {
        debug_assert!(op.is_terminator());
        self.push_void(op);
    }

    /// Termina el bloque actual y continúa en uno inalcanzable.
    fn dead_end(&mut self, op: Op) {
        self.terminate(op);

        let dead = self.new_block("dead");
        self.position(dead);
    }

    fn append(&mut self, instruction: Instruction) {
        self.blocks[self.current.0 as usize]
            .instructions
            .push(instruction);
    }
}

/// Cantidad de palabras de un objeto con estas dimensiones.
fn words(dimensions: &[u32], name: &Located<Identifier>) -> Lower<u32> {
    dimensions
        .iter()
        .try_fold(1u32, |words, &size| words.checked_mul(size))
        .filter(|&words| words <= i32::MAX as u32 / 4)
        .ok_or_else(|| {
            let total = dimensions.iter().map(|&size| size as i64).product();
            Located::at(LowerError::BadDimension(total), name.location().clone())
        })
}

/// Aplana un inicializador a una palabra por elemento.
///
/// Una sublista se alinea al inicio del siguiente subarreglo de la
/// dimensión correspondiente. Los elementos faltantes quedan en `None`
/// y los sobrantes se descartan.
fn flatten<'a>(init: &'a Located<InitVal>, dimensions: &[u32]) -> Vec<Option<&'a Located<Expr>>> {
    let mut items = Vec::new();
    match init.as_ref() {
        InitVal::Expr(expr) => items.push(Some(expr)),
        InitVal::List(list) => flatten_list(list, dimensions, &mut items),
    }

    let size = dimensions.iter().product::<u32>() as usize;
    items.resize(size, None);
    items
}

fn flatten_list<'a>(
    list: &'a [Located<InitVal>],
    dimensions: &[u32],
    items: &mut Vec<Option<&'a Located<Expr>>>,
) {
    let start = items.len();
    let size = dimensions.iter().product::<u32>() as usize;
    let inner = dimensions.get(1..).unwrap_or(&[]);
    let stride = inner.iter().product::<u32>() as usize;

    for item in list {
        let filled = items.len() - start;
        if filled >= size {
            break;
        }

        match item.as_ref() {
            InitVal::Expr(expr) => items.push(Some(expr)),

            InitVal::List(sublist) => {
                let aligned = (filled + stride - 1) / stride * stride;
                if aligned >= size {
                    break;
                }

                items.resize(start + aligned, None);
                flatten_list(sublist, inner, items);
                items.resize(start + aligned + stride, None);
            }
        }
    }

    items.resize(start + size, None);
}
