//! Análisis léxico.
//!
//! # Tokenization
//! Esta es la primera fase del compilador. Descompone un flujo de
//! caracteres con ubicaciones (ver [`crate::source::consume()`]) en
//! unidades léxicas denominadas tokens. Los espacios en blanco y los
//! comentarios (`//` y `/* */`) se descartan durante esta operación.
//! Cada token emitido esta asociado a una ubicación en el código fuente
//! original.
//!
//! # Contenido de un token
//! Operadores, puntuación y palabras clave se identifican por el hecho
//! de lo que son y no incluyen lexemas. Los identificadores y las
//! constantes enteras sí incluyen su lexema original. Las constantes
//! se validan aquí, pero su valor se decodifica con [`decode_int()`]
//! en el momento en que se necesita, ya que el árbol sintáctico
//! preserva el texto literal.
//!
//! # Errores
//! El lexer es capaz de recuperarse parcialmente de condiciones de error.
//! Esto ocurre en suficiente grado como para reportar más de un error por
//! ejecución, pero no lo suficiente como para permitir el avance a las
//! demás fases de la compilación.

use crate::source::{Located, Location};
use std::{
    fmt::{self, Display},
    io,
    iter::Peekable,
    rc::Rc,
    str::FromStr,
};

use thiserror::Error;

/// Error de escaneo.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LexerError {
    /// Error de E/S originado por el flujo de entrada.
    #[error("I/O error")]
    Input(#[from] io::Error),

    /// Carácter desconocido o inesperado en el flujo de entrada.
    #[error("Bad character {0:?} in input stream")]
    BadChar(char),

    /// Se esperaba un carácter específico en esta posición.
    #[error("Expected {0:?}")]
    Expected(char),

    /// Una constante entera no cabe en 32 bits.
    #[error("Integer literal overflow, valid range is [0, {}]", u32::MAX)]
    IntOverflow,

    /// Una constante entera tiene dígitos inválidos para su base.
    #[error("Malformed integer literal `{0}`")]
    BadLiteral(String),

    /// Un comentario de bloque no fue cerrado.
    #[error("Unterminated block comment")]
    UnterminatedComment,
}

/// Un identificador.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(Rc<str>);

impl Identifier {
    pub fn new(name: &str) -> Self {
        Identifier(Rc::from(name))
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Identifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// Objeto resultante del análisis léxico.
///
/// Un token contiene suficiente información para describir completamente
/// a una entidad léxica en el programa fuente.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Identificador.
    Id(Identifier),

    /// Palabra clave.
    Keyword(Keyword),

    /// Literal de entero, con su texto original.
    IntLiteral(Rc<str>),

    /// `=`
    Assign,

    /// `,`
    Comma,

    /// `;`
    Semicolon,

    /// `+`
    Plus,

    /// `-`
    Minus,

    /// `*`
    Times,

    /// `/`
    Slash,

    /// `%`
    Percent,

    /// `==`
    Equal,

    /// `!=`
    NotEqual,

    /// `<`
    Less,

    /// `>`
    Greater,

    /// `<=`
    LessOrEqual,

    /// `>=`
    GreaterOrEqual,

    /// `!`
    Not,

    /// `&&`
    And,

    /// `||`
    Or,

    /// `(`
    OpenParen,

    /// `)`
    CloseParen,

    /// `{`
    OpenCurly,

    /// `}`
    CloseCurly,

    /// `[`
    OpenSquare,

    /// `]`
    CloseSquare,
}

impl Display for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Token::*;

        let symbol = match self {
            Id(id) => return write!(fmt, "identifier `{}`", id),
            Keyword(keyword) => return write!(fmt, "keyword `{}`", keyword),
            IntLiteral(integer) => return write!(fmt, "literal `{}`", integer),
            Assign => "=",
            Comma => ",",
            Semicolon => ";",
            Plus => "+",
            Minus => "-",
            Times => "*",
            Slash => "/",
            Percent => "%",
            Equal => "==",
            NotEqual => "!=",
            Less => "<",
            Greater => ">",
            LessOrEqual => "<=",
            GreaterOrEqual => ">=",
            Not => "!",
            And => "&&",
            Or => "||",
            OpenParen => "(",
            CloseParen => ")",
            OpenCurly => "{",
            CloseCurly => "}",
            OpenSquare => "[",
            CloseSquare => "]",
        };

        write!(fmt, "`{}`", symbol)
    }
}

/// Una palabra clave.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Keyword {
    Const,
    Int,
    Void,
    If,
    Else,
    While,
    Break,
    Continue,
    Return,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("const", Keyword::Const),
    ("int", Keyword::Int),
    ("void", Keyword::Void),
    ("if", Keyword::If),
    ("else", Keyword::Else),
    ("while", Keyword::While),
    ("break", Keyword::Break),
    ("continue", Keyword::Continue),
    ("return", Keyword::Return),
];

impl Display for Keyword {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = KEYWORDS
            .iter()
            .find(|(_, keyword)| keyword == self)
            .map(|(name, _)| *name)
            .unwrap_or("?");

        fmt.write_str(name)
    }
}

impl FromStr for Keyword {
    type Err = ();

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        KEYWORDS
            .iter()
            .find(|(name, _)| *name == string)
            .map(|&(_, keyword)| keyword)
            .ok_or(())
    }
}

/// Decodifica el texto de una constante entera.
///
/// Se aceptan constantes decimales, octales (prefijo `0`) y
/// hexadecimales (prefijo `0x` o `0X`). El valor se interpreta
/// como 32 bits sin signo y se reinterpreta en complemento a dos,
/// de forma que `-2147483648` y `0xffffffff` son representables.
pub fn decode_int(text: &str) -> Result<i32, LexerError> {
    let bad = || LexerError::BadLiteral(text.to_owned());

    let (digits, radix) = if text.len() > 2 && unicase::eq_ascii(&text[..2], "0x") {
        (&text[2..], 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(bad());
    }

    let mut value: u32 = 0;
    for digit in digits.chars().filter_map(|c| c.to_digit(radix)) {
        value = value
            .checked_mul(radix)
            .and_then(|value| value.checked_add(digit))
            .ok_or(LexerError::IntOverflow)?;
    }

    Ok(value as i32)
}

/// Máquina de estados para análisis léxico.
///
/// Un lexer puede encontrarse en uno de diversos estados. La
/// salida del lexer, así como su siguiente estado, se define
/// a partir de tanto su estado actual como el siguiente carácter
/// encontrado en el flujo de entrada.
pub struct Lexer<S: Iterator> {
    source: Peekable<S>,
    state: State,
    start: Location,
    last: Location,
}

/// Posibles estados del lexer.
enum State {
    /// Estado que ocurre antes de encontrar el inicio de un token.
    Start,

    /// Estado de error.
    Error,

    /// Estado de completitud; siempre emite el token incluido,
    /// consume la entrada actual y pasa a [`State::Start`].
    Complete(Token),

    /// Se encontró un operador de un carácter que puede extenderse
    /// a dos caracteres si sigue `=`.
    Relational(Token, Token),

    /// Se encontró `&` o `|`, debe seguir el mismo carácter.
    Doubled(char, Token),

    /// Se encontró `/`, puede ser división o inicio de comentario.
    SlashOrComment,

    /// Comentario de línea.
    ///
    /// Este estado vuelve a [`State::Start`] al encontrar `'\n'`.
    LineComment,

    /// Comentario de bloque, con indicación de si el último carácter fue `*`.
    BlockComment { star: bool },

    /// Constante entera, acumulada como texto.
    Integer(String),

    /// Término que puede ser un identificador o una palabra clave.
    Word(String),
}

impl<S> Lexer<S>
where
    S: Iterator<Item = io::Result<(char, Location)>>,
{
    /// Crea un lexer en estado inicial a partir de un flujo.
    pub fn new(start: Location, source: S) -> Self {
        let last = start.clone();
        Lexer {
            source: source.peekable(),
            state: State::Start,
            start,
            last,
        }
    }

    /// Reduce la entrada a sea una secuencia conocida de tokens
    /// infalibles o una secuencia de errores.
    ///
    /// En caso de que ocurra al menos un error, el lexer dejará
    /// de buscar tokens exitosos y comenzará a acumular solamente
    /// errores.
    pub fn try_exhaustive(mut self) -> Result<Vec<Located<Token>>, Vec<Located<LexerError>>> {
        let mut tokens = Vec::new();

        while let Some(result) = self.next() {
            match result {
                Ok(token) => tokens.push(token),
                Err(error) => {
                    drop(tokens);

                    let mut errors = vec![error];
                    errors.extend(self.filter_map(Result::err));

                    return Err(errors);
                }
            }
        }

        Ok(tokens)
    }

    /// Intenta construir un siguiente token.
    fn lex(&mut self) -> Result<Option<Token>, LexerError> {
        use {State::*, Token::*};

        loop {
            // Se espera un siguiente carácter, fallando si hay error de E/S
            let (next_char, next_location) = match self.source.peek() {
                None => (None, None),
                Some(Ok((c, location))) => (Some(*c), Some(location.clone())),
                Some(Err(_)) => match self.source.next() {
                    Some(Err(error)) => return Err(error.into()),
                    _ => unreachable!(),
                },
            };

            // La posición de origen se mueve junto a la posición
            // siguiente siempre que no se haya encontrado una
            // frontera de token
            if let (Start, Some(location)) = (&self.state, &next_location) {
                self.start = location.clone();
            }

            // Switch table principal, determina cambios de estado
            // y de salida del lexer a partir de combinaciones del
            // estado actual y el siguiente carácter
            match (&mut self.state, next_char) {
                // Condiciones de error: se descarta la línea donde
                // ocurrió el error. Al llegar al final de la línea
                // el lexer se recupera y reinicia.
                (Error, None) => return Ok(None),
                (Error, Some('\n')) => self.state = Start,
                (Error, Some(_)) => (),

                // Tokens triviales
                (Start, None) => return Ok(None),
                (Start, Some(',')) => self.state = Complete(Comma),
                (Start, Some(';')) => self.state = Complete(Semicolon),
                (Start, Some('+')) => self.state = Complete(Plus),
                (Start, Some('-')) => self.state = Complete(Minus),
                (Start, Some('*')) => self.state = Complete(Times),
                (Start, Some('%')) => self.state = Complete(Percent),
                (Start, Some('(')) => self.state = Complete(OpenParen),
                (Start, Some(')')) => self.state = Complete(CloseParen),
                (Start, Some('{')) => self.state = Complete(OpenCurly),
                (Start, Some('}')) => self.state = Complete(CloseCurly),
                (Start, Some('[')) => self.state = Complete(OpenSquare),
                (Start, Some(']')) => self.state = Complete(CloseSquare),

                // Operadores que pueden extenderse con `=`
                (Start, Some('=')) => self.state = Relational(Assign, Equal),
                (Start, Some('!')) => self.state = Relational(Not, NotEqual),
                (Start, Some('<')) => self.state = Relational(Less, LessOrEqual),
                (Start, Some('>')) => self.state = Relational(Greater, GreaterOrEqual),

                // Operadores lógicos
                (Start, Some('&')) => self.state = Doubled('&', And),
                (Start, Some('|')) => self.state = Doubled('|', Or),

                (Start, Some('/')) => self.state = SlashOrComment,

                // Identificadores y palabras clave
                (Start, Some(c)) if c.is_ascii_alphabetic() || c == '_' => {
                    self.state = Word(c.to_string())
                }

                (Start, Some(c)) if c.is_ascii_digit() => self.state = Integer(c.to_string()),

                // Espacios en blanco y caracteres inesperados
                (Start, Some(c)) if c.is_ascii_whitespace() => (),
                (Start, Some(c)) => {
                    self.source.next();
                    return Err(LexerError::BadChar(c));
                }

                // Emisión retardada de tokens cualesquiera
                (Complete(token), _) => return Ok(Some(std::mem::replace(token, Plus))),

                (Relational(_, long), Some('=')) => self.state = Complete(long.clone()),
                (Relational(short, _), _) => return Ok(Some(std::mem::replace(short, Plus))),

                (Doubled(expected, token), Some(c)) if c == *expected => {
                    self.state = Complete(std::mem::replace(token, Plus))
                }

                (Doubled(expected, _), _) => return Err(LexerError::Expected(*expected)),

                // `/` puede iniciar un comentario de línea o de bloque
                (SlashOrComment, Some('/')) => self.state = LineComment,
                (SlashOrComment, Some('*')) => self.state = BlockComment { star: false },
                (SlashOrComment, _) => return Ok(Some(Slash)),

                // Los comentarios de línea descartan la línea donde ocurren
                (LineComment, Some('\n')) | (LineComment, None) => self.state = Start,
                (LineComment, Some(_)) => (),

                (BlockComment { star: true }, Some('/')) => self.state = Start,
                (BlockComment { star }, Some(c)) => *star = c == '*',
                (BlockComment { .. }, None) => return Err(LexerError::UnterminatedComment),

                // Acumulación de constantes enteras; cualquier carácter
                // alfanumérico forma parte del literal, el cual se valida
                // al terminar
                (Integer(text), Some(c)) if c.is_ascii_alphanumeric() => text.push(c),
                (Integer(text), _) => {
                    let text = std::mem::take(text);
                    decode_int(&text)?;

                    return Ok(Some(IntLiteral(Rc::from(text))));
                }

                // Extensión de términos
                (Word(word), Some(c)) if is_word_char(c) => word.push(c),

                // Si sigue algo que no puede formar parte del término, ha terminado
                (Word(word), _) => {
                    let token = match self::Keyword::from_str(word) {
                        Ok(keyword) => Keyword(keyword),
                        Err(()) => Id(Identifier::new(word)),
                    };

                    return Ok(Some(token));
                }
            }

            // Si no hubo retorno, aquí se consume el carácter que
            // se observó con lookahead anteriormente
            if let Some(Ok((_, location))) = self.source.next() {
                self.last = location;
            }
        }
    }
}

impl<S> Iterator for Lexer<S>
where
    S: Iterator<Item = io::Result<(char, Location)>>,
{
    type Item = Result<Located<Token>, Located<LexerError>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lex() {
            Ok(None) => None,
            Ok(Some(token)) => {
                self.state = State::Start;

                let location = Location::span(self.start.clone(), &self.last);
                Some(Ok(Located::at(token, location)))
            }

            Err(error) => {
                self.state = State::Error;
                Some(Err(Located::at(error, self.start.clone())))
            }
        }
    }
}

/// Determina si un carácter puede pertenecer a un término.
fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source;

    fn tokens(text: &str) -> Vec<Token> {
        let (start, stream) = source::consume_str(text, "<test>");
        Lexer::new(start, stream)
            .try_exhaustive()
            .expect("lexical errors")
            .into_iter()
            .map(Located::into_inner)
            .collect()
    }

    #[test]
    fn decodes_all_radixes() {
        assert_eq!(decode_int("0").unwrap(), 0);
        assert_eq!(decode_int("123").unwrap(), 123);
        assert_eq!(decode_int("010").unwrap(), 8);
        assert_eq!(decode_int("0x1F").unwrap(), 31);
        assert_eq!(decode_int("0XfF").unwrap(), 255);
        assert_eq!(decode_int("0xffffffff").unwrap(), -1);
    }

    #[test]
    fn rejects_malformed_literals() {
        assert!(matches!(decode_int("019"), Err(LexerError::BadLiteral(_))));
        assert!(matches!(decode_int("12ab"), Err(LexerError::BadLiteral(_))));
        assert!(matches!(
            decode_int("99999999999"),
            Err(LexerError::IntOverflow)
        ));
    }

    #[test]
    fn splits_operators_and_comments() {
        use Token::*;

        let found = tokens("a<=b // c\n/* d\n*/ !x&&y||z != 010");
        assert_eq!(
            found,
            vec![
                Id(Identifier::new("a")),
                LessOrEqual,
                Id(Identifier::new("b")),
                Not,
                Id(Identifier::new("x")),
                And,
                Id(Identifier::new("y")),
                Or,
                Id(Identifier::new("z")),
                NotEqual,
                IntLiteral(Rc::from("010")),
            ]
        );
    }

    #[test]
    fn tracks_lines() {
        let (start, stream) = source::consume_str("int\n\n  x;", "<test>");
        let found = Lexer::new(start, stream).try_exhaustive().unwrap();

        let lines: Vec<_> = found.iter().map(Located::line).collect();
        assert_eq!(lines, vec![1, 3, 3]);
    }

    #[test]
    fn reports_bad_characters() {
        let (start, stream) = source::consume_str("int a = 1;\nint #b;\n", "<test>");
        let errors = Lexer::new(start, stream).try_exhaustive().unwrap_err();

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line(), 2);
        assert!(matches!(errors[0].as_ref(), LexerError::BadChar('#')));
    }
}
