use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, space0},
    combinator::recognize,
    error::{ParseError, VerboseError},
    multi::many0,
    sequence::{delimited, pair},
    IResult, Parser,
};

pub fn spaces<'a, E: ParseError<&'a str>>(i: &'a str) -> IResult<&'a str, &'a str, E> {
    let chars = " \t\r\n";
    take_while(move |c| chars.contains(c))(i)
}

pub fn identifier(input: &str) -> IResult<&str, &str, VerboseError<&str>> {
    recognize(pair(alt((alpha1, tag("_"))), many0(alt((alphanumeric1, tag("_")))))).parse(input)
}

pub fn identifier_token(input: &str) -> IResult<&str, &str, VerboseError<&str>> {
    recognize(delimited(space0, identifier, space0)).parse(input)
}

/// JS-style identifiers also allow `$`.
pub fn js_identifier(input: &str) -> IResult<&str, &str, VerboseError<&str>> {
    recognize(pair(
        alt((alpha1, tag("_"), tag("$"))),
        many0(alt((alphanumeric1, tag("_"), tag("$")))),
    ))
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert_eq!(identifier("identifier"), Ok(("", "identifier")));
        assert_eq!(identifier("_underscore"), Ok(("", "_underscore")));
        assert_eq!(identifier("id123"), Ok(("", "id123")));
        assert_eq!(identifier("longer_identifier_with_123"), Ok(("", "longer_identifier_with_123")));
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(identifier("123start").is_err());
        assert!(identifier_token("-leading").is_err());
        assert!(identifier("").is_err());
    }

    #[test]
    fn test_js_identifier() {
        assert_eq!(js_identifier("$ref"), Ok(("", "$ref")));
        assert_eq!(js_identifier("_x$1"), Ok(("", "_x$1")));
        assert!(js_identifier("1x").is_err());
    }
}
