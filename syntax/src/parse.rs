use anyhow::Result;

#[derive(Debug, thiserror::Error)]
#[error("ParseError on line {lineno} '{line}': {msg}")]
pub struct Error {
    msg: String,
    lineno: usize,
    line: String,
}

impl Error {
    fn at(text: &str, pos: usize, msg: String) -> Self {
        // isolate the line in question:
        let pos = pos.min(text.len());
        let before = &text[0..pos];
        let after = &text[pos..];
        let prefix: String = before.chars().rev().take_while(|&c| c != '\n').collect();
        let prefix: String = prefix.chars().rev().collect();
        let suffix: String = after.chars().take_while(|&c| c != '\n').collect();
        Self {
            msg,
            lineno: before.matches('\n').count() + 1,
            line: prefix + &suffix,
        }
    }
}

/// Parse the full text of a `.sos` script.
pub fn parse(text: &str) -> Result<Vec<crate::ast::Item<'_>>> {
    use combine::EasyParser;
    let (items, remainder) = script::items().easy_parse(text).map_err(|e| {
        let pos = e.position.translate_position(text);
        // since converting combine's errors is a lifetime nightmare,
        // we just stringify the error before returning it.
        Error::at(text, pos, format!("{}", e))
    })?;
    if !remainder.trim().is_empty() {
        let pos = text.len() - remainder.len();
        return Err(Error::at(text, pos, "expected 'step' or 'global' block".to_owned()).into());
    }
    Ok(items)
}

pub mod prelude {
    pub use combine::parser::char::{char, string};
    pub use combine::parser::range::recognize;
    pub use combine::*;
}

pub mod util {

    use super::prelude::*;
    use combine::parser::char::{alpha_num, letter, space};

    p! {
        ident_start() -> char, {
            char('_').or(letter())
        }
    }

    p! {
        ident_rest() -> Vec<char>, {
            many(char('_').or(alpha_num()))
        }
    }

    p! {
        ident() -> &'a str, {
            recognize(ident_start().and(ident_rest()))
        }
    }

    // a comment may be the last thing in the file, w/o a trailing newline:
    p! {
        comment() -> &'a str, {
            recognize(
                char('#')
                .and(skip_many(none_of("\n".chars())))
                .and(optional(char('\n')))
            )
        }
    }

    p! {
        whitespace() -> (), {
            skip_many1(
                space().map(|_| ()).or(comment().map(|_| ()))
            )
        }
    }

    wrapper! {
        lex(parser), {
            optional(whitespace()).with(parser).skip(optional(whitespace()))
        }
    }

    p! {
        line_internal_whitespace() -> (), {
            skip_many1(satisfy(|c: char| c.is_whitespace() && c != '\n'))
        }
    }

    wrapper! {
        lex_inline(parser), {
            optional(line_internal_whitespace())
                .with(parser)
                .skip(optional(line_internal_whitespace()))
        }
    }

    // parser, followed by *mandatory* line-internal whitespace
    wrapper! {
        lex_word_inline(parser), {
            optional(line_internal_whitespace()).with(parser).skip(line_internal_whitespace())
        }
    }

    wrapper! {
        parens(parser), {
            char('(').with(parser).skip(char(')'))
        }
    }

    wrapper! {
        braces(parser), {
            char('{').with(parser).skip(char('}'))
        }
    }

    p! {
        eol() -> (), {
            eof().or(char('\n').and(optional(whitespace())).map(|_| ()))
        }
    }

    wrapper! {
        line(parser), {
            lex_inline(parser).skip(eol())
        }
    }

    #[cfg(test)]
    mod test {
        use anyhow::Result;
        use combine::parser::char::char;
        use combine::EasyParser;
        #[test]
        fn test_ident() -> Result<()> {
            assert_eq!("align_10", super::ident().easy_parse("align_10").unwrap().0);
            assert_eq!(
                "_start_under123",
                super::ident().easy_parse("_start_under123").unwrap().0
            );
            assert!(super::ident().easy_parse("1name").is_err());
            Ok(())
        }
        #[test]
        fn test_whitespace() -> Result<()> {
            assert_eq!(
                ((), "and more"),
                super::whitespace().easy_parse(" and more").unwrap()
            );
            assert_eq!(
                ((), "and text"),
                super::whitespace().easy_parse(" # a comment\n    and text").unwrap()
            );
            assert_eq!(((), ""), super::whitespace().easy_parse("# trailing").unwrap());
            assert!(super::whitespace().easy_parse("x").is_err());
            Ok(())
        }
        #[test]
        fn test_lex_inline() -> Result<()> {
            assert_eq!(
                'x',
                super::lex_inline(char('x')).easy_parse("  x  ").unwrap().0
            );
            assert!(super::lex_inline(char('x')).easy_parse("\nx").is_err());
            assert_eq!(
                ('x', "\n"),
                super::lex_inline(char('x')).easy_parse("x\n").unwrap()
            );
            Ok(())
        }
        #[test]
        fn test_eol() -> Result<()> {
            assert_eq!(
                ((), "other stuff"),
                super::eol().easy_parse("\n  \n   other stuff").unwrap()
            );
            assert_eq!(((), ""), super::eol().easy_parse("").unwrap());
            Ok(())
        }
    }
}

mod literal {

    use super::prelude::*;

    // also forbids chars that start or end other header chunks:
    const FORBID_UNQUOTED: [char; 17] = [
        '(', ')', '[', ']', '{', '}', '<', '>', '^', '?', ',', ':', '@', '$', '#', '"', '\'',
    ];

    wrapper! {
        double_quotes(parser), {
            char('"').with(parser).skip(char('"'))
        }
    }

    p! {
        double_quoted_literal() -> &'a str, {
            double_quotes(recognize(skip_many(none_of("\"".chars()))))
        }
    }

    p! {
        unquoted_literal_char() -> char, {
            satisfy(|c: char|
                !c.is_whitespace() && !FORBID_UNQUOTED.iter().any(|&forbidden| forbidden == c)
            )
        }
    }

    p! {
        unquoted_literal() -> &'a str, {
            recognize(skip_many1(unquoted_literal_char()))
        }
    }

    p! {
        literal() -> &'a str, {
            double_quoted_literal().or(unquoted_literal())
        }
    }

    p! {
        interp_literal() -> (&'a str, Vec<&'a str>), {
            super::interp::double_quoted_interp_string()
                .or(unquoted_literal().map(|s| (s, Vec::with_capacity(0))))
        }
    }

}

mod interp {
    use super::prelude::*;
    use super::rhs::variable;
    use combine::parser::range::recognize_with_value;

    p! {
        interp_content() -> (&'a str, Vec<&'a str>), {
            recognize_with_value(
                skip_many(none_of("$\"\\".chars()))
                    .with(optional(variable().and(interp_content())))
            ).map(|(full_text, parsed_suffix)| {
                if let Some((var, (_, mut rest_vars))) = parsed_suffix {
                    rest_vars.insert(0, var);
                    (full_text, rest_vars)
                } else {
                    (full_text, Vec::with_capacity(0))
                }
            })
        }
    }

    p! {
        double_quoted_interp_string() -> (&'a str, Vec<&'a str>), {
            super::literal::double_quotes(interp_content())
        }
    }
}

mod rhs {

    use super::literal::interp_literal;
    use super::prelude::*;
    use super::util::ident;
    use crate::ast::Rhs;

    p! {
        variable() -> &'a str, {
            char('$').with(ident())
        }
    }

    p! {
        rhs() -> Rhs<'a>, {
            choice!(
                attempt(
                    interp_literal().map(|(text, vars)| {
                        if vars.is_empty() {
                            Rhs::Literal { val: text }
                        } else {
                            Rhs::Interp { text, vars }
                        }
                    })
                ),
                variable().map(|name| Rhs::Variable { name })
            )
        }
    }

}

mod assignment {

    use super::prelude::*;
    use super::rhs::rhs;
    use super::util::{ident, lex_inline, line_internal_whitespace};
    use crate::ast::Rhs;

    p! {
        assignment() -> (&'a str, Rhs<'a>), {
            ident().and(
                choice!(
                    attempt(lex_inline(char('=')).with(rhs())),
                    optional(line_internal_whitespace()).map(|_| Rhs::Unbound)
                )
            )
        }
    }

}

mod target {

    use super::literal::interp_literal;
    use super::prelude::*;
    use super::rhs::variable;
    use super::util::{ident, lex_inline};
    use crate::ast::TargetRef;

    p! {
        target_ref() -> TargetRef<'a>, {
            choice!(
                char('?').map(|_| TargetRef::Undetermined),
                char('@').with(ident()).map(TargetRef::Step),
                variable().map(TargetRef::Var),
                interp_literal().map(|(text, vars)| TargetRef::File { text, vars })
            )
        }
    }

    // space- or comma-separated, on a single line:
    p! {
        target_list() -> Vec<TargetRef<'a>>, {
            many1(lex_inline(target_ref()).skip(optional(lex_inline(char(',')))))
        }
    }

}

mod spec {

    use super::assignment::assignment;
    use super::prelude::*;
    use super::target::target_list;
    use super::util::{lex_inline, whitespace};
    use crate::ast::BlockSpec;

    p! {
        input_chunk() -> Vec<BlockSpec<'a>>, {
            lex_inline(char('<')).with(target_list()).map(|t| vec![BlockSpec::Input(t)])
        }
    }

    p! {
        output_chunk() -> Vec<BlockSpec<'a>>, {
            lex_inline(char('>')).with(target_list()).map(|t| vec![BlockSpec::Output(t)])
        }
    }

    p! {
        depends_chunk() -> Vec<BlockSpec<'a>>, {
            lex_inline(char('^')).with(target_list()).map(|t| vec![BlockSpec::Depends(t)])
        }
    }

    p! {
        option_chunk() -> Vec<BlockSpec<'a>>, {
            lex_inline(string("::")).with(many1(
                lex_inline(assignment()).map(|(key, rhs)| BlockSpec::Option { key, rhs })
            ))
        }
    }

    p! {
        spec_chunk() -> Vec<BlockSpec<'a>>, {
            choice!(
                input_chunk(),
                output_chunk(),
                depends_chunk(),
                option_chunk()
            )
        }
    }

    // each chunk eats its own trailing whitespace, so that a failed attempt
    // at the body's opening brace doesn't consume any input:
    p! {
        specs() -> Vec<BlockSpec<'a>>, {
            many(spec_chunk().skip(optional(whitespace())))
                .map(|vecs: Vec<Vec<BlockSpec<'a>>>| {
                    vecs.into_iter().flatten().collect()
                })
        }
    }

}

mod step {
    use super::prelude::*;
    use super::spec::specs;
    use super::util::{braces, ident, lex_word_inline, whitespace};
    use crate::ast::StepBlock;
    use crate::bash::bash_code;

    p! {
        step() -> StepBlock<'a>, {
            lex_word_inline(string("step"))
                .with(ident())
                .skip(optional(whitespace()))
                .and(specs())
                .and(braces(bash_code()))
                .map(|((name, specs), code)| StepBlock { name, specs, code })
        }
    }

}

mod config {
    use super::assignment::assignment;
    use super::prelude::*;
    use super::util::{braces, lex, line, whitespace};
    use crate::ast::Rhs;

    p! {
        global_config() -> Vec<(&'a str, Rhs<'a>)>, {
            lex(string("global")).with(braces(
                optional(whitespace()).with(
                    many(line(assignment()))
                )
            ))
        }
    }

    #[cfg(test)]
    mod test {
        use crate::ast::Rhs;
        use combine::EasyParser;
        #[test]
        fn test_global() {
            assert_eq!(
                vec![
                    ("genome", Rhs::literal("hg38")),
                    (
                        "label",
                        Rhs::Interp {
                            text: "run-$genome",
                            vars: vec!["genome"]
                        }
                    ),
                ],
                super::global_config()
                    .easy_parse("global {\n  genome=hg38\n  label=\"run-$genome\"\n}")
                    .unwrap()
                    .0
            );
        }
    }
}

mod script {
    use super::{config::global_config, prelude::*, step::step, util::lex};
    use crate::ast::Item;

    p! {
        item() -> Item<'a>, {
            choice!(
                step().map(Item::Step),
                global_config().map(Item::GlobalConfig)
            )
        }
    }

    p! {
        items() -> Vec<Item<'a>>, {
            many(lex(item()))
        }
    }
}

#[cfg(test)]
mod test {
    use crate::ast::Item;
    use anyhow::Result;

    const SCRIPT: &str = r#"
# a small workflow
global {
    genome=hg38
}

step default_1 > "f1" {
    echo $genome > f1
}

step default_2 < "f1" > f2 :: shared=count {
    cat f1 > f2   # copy
    echo "count=2" >> "$SOS_SHARED"
}

step make_csv :: provides="data/{year}.csv" {
    echo ${year} > data/${year}.csv
}
"#;

    #[test]
    fn test_parse_script() -> Result<()> {
        let items = super::parse(SCRIPT)?;
        assert_eq!(4, items.len());
        assert!(matches!(items[0], Item::GlobalConfig(_)));
        let names: Vec<_> = items
            .iter()
            .filter_map(|item| match item {
                Item::Step(step) => Some(step.name),
                _ => None,
            })
            .collect();
        assert_eq!(vec!["default_1", "default_2", "make_csv"], names);
        Ok(())
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = super::parse("step ok {\n echo\n}\nbogus here\n").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("line 4"), "{msg}");
        assert!(msg.contains("bogus here"), "{msg}");
    }
}
