//! Scanner for the shell code in step bodies.
//!
//! We don't validate bash; we only need to find where the body ends
//! (matching braces, respecting quotes, comments and heredocs) and which
//! variables it reads, so the analyzer can work out its environment.

use crate::parse::prelude::*;
use crate::parse::util::{braces, comment, ident, parens, whitespace};
use combine::parser::range::recognize_with_value;
use combine::parser::repeat::skip_until;

/// A scanned piece of code: its full text plus the variables it references.
type Scanned<'a> = (&'a str, Vec<&'a str>);

fn plain(s: &str) -> Scanned<'_> {
    (s, Vec::with_capacity(0))
}

fn single_var<'a>((s, v): (&'a str, &'a str)) -> Scanned<'a> {
    (s, vec![v])
}

// merge the vars of an element with the vars of whatever follows it.
fn joined<'a>(
    (full_text, suffix): (&'a str, Option<(Scanned<'a>, Scanned<'a>)>),
) -> Scanned<'a> {
    match suffix {
        Some(((_, mut head), (_, mut tail))) => {
            head.append(&mut tail);
            (full_text, head)
        }
        None => plain(full_text),
    }
}

fn outer<'a>((full_text, (_, vars)): (&'a str, Scanned<'a>)) -> Scanned<'a> {
    (full_text, vars)
}

// ---- quoting ----

p! {
    single_quoted() -> &'a str, {
        recognize(
            char('\'').and(skip_many(none_of("'".chars()))).and(char('\''))
        )
    }
}

p! {
    escaped_char() -> &'a str, {
        recognize(char('\\').and(any()))
    }
}

p! {
    double_quoted_element() -> Scanned<'a>, {
        choice!(
            dollar_expr(),
            escaped_char().map(plain)
        )
    }
}

// single quotes are literal inside double quotes, so only '$' and '\' matter:
p! {
    double_quoted_body() -> Scanned<'a>, {
        recognize_with_value(
            skip_many(none_of("$\"\\".chars()))
                .with(optional(double_quoted_element().and(double_quoted_body())))
        ).map(joined)
    }
}

p! {
    double_quoted() -> Scanned<'a>, {
        recognize_with_value(
            char('"').with(double_quoted_body()).skip(char('"'))
        ).map(outer)
    }
}

// ---- dollar expressions ----

// $1, $@, $?, $$ and friends.
p! {
    special_param() -> &'a str, {
        recognize(
            char('$').and(one_of("*@#?-$!0123456789".chars()))
        )
    }
}

p! {
    plain_var() -> (&'a str, &'a str), {
        recognize_with_value(char('$').with(ident()))
    }
}

p! {
    braced_var() -> (&'a str, &'a str), {
        recognize_with_value(char('$').with(braces(ident())))
    }
}

// ${name:-default}, ${#name}, ${name%.*} and so on: we keep the leading name
// when there is one, and don't look inside the rest.
p! {
    param_expansion() -> Scanned<'a>, {
        recognize_with_value(
            char('$').with(braces(
                optional(char('#'))
                    .with(optional(ident()))
                    .skip(skip_many1(none_of("}".chars())))
            ))
        ).map(|(text, name): (&'a str, Option<&'a str>)| match name {
            Some(name) => (text, vec![name]),
            None => plain(text),
        })
    }
}

// $'\n' style ansi-c quoting.
p! {
    ansi_c_quoted() -> &'a str, {
        recognize(
            string("$'").and(skip_many(none_of("'".chars()))).and(char('\''))
        )
    }
}

// $( .. ) and $(( .. )); arithmetic is just a subshell with extra parens here.
p! {
    command_sub() -> Scanned<'a>, {
        recognize_with_value(char('$').with(paren_group())).map(outer)
    }
}

// a literal '$' followed by whitespace, or at the end of a quoted string.
p! {
    bare_dollar() -> &'a str, {
        recognize(char('$').and(whitespace().or(look_ahead(char('"')).map(|_| ()))))
    }
}

p! {
    dollar_expr() -> Scanned<'a>, {
        choice!(
            attempt(special_param().map(plain)),
            attempt(command_sub()),
            attempt(plain_var().map(single_var)),
            attempt(braced_var().map(single_var)),
            attempt(param_expansion()),
            attempt(ansi_c_quoted().map(plain)),
            bare_dollar().map(plain)
        )
    }
}

// ---- heredocs ----

// vars inside heredocs are not collected; the body runs up to the next
// occurrence of the marker.
p! {
    heredoc_from(marker: &'static str) -> &'a str, {
        recognize(
            string(marker)
                .and(optional(char('\'')))
                .and(skip_until(attempt(string(marker))))
                .and(string(marker))
        )
    }
}

p! {
    heredoc() -> &'a str, {
        recognize(
            string("<<")
                .and(optional(char('-')))
                .and(optional(char('\'')))
                .and(choice!(heredoc_from("EOF"), heredoc_from("END")))
        )
    }
}

// ---- structure ----

p! {
    paren_group() -> Scanned<'a>, {
        recognize_with_value(parens(code())).map(outer)
    }
}

p! {
    brace_group() -> Scanned<'a>, {
        recognize_with_value(braces(code())).map(outer)
    }
}

p! {
    process_sub() -> Scanned<'a>, {
        recognize_with_value(one_of("<>".chars()).with(paren_group())).map(outer)
    }
}

// text that can't contain a variable, a quote or a bracket.
p! {
    inert() -> &'a str, {
        recognize(skip_many(none_of("{}()\"'#$<>\\".chars())))
    }
}

p! {
    element() -> Scanned<'a>, {
        choice!(
            escaped_char().map(plain),
            dollar_expr(),
            attempt(process_sub()),
            attempt(heredoc().map(plain)),
            recognize(one_of("<>".chars())).map(plain),
            paren_group(),
            brace_group(),
            single_quoted().map(plain),
            double_quoted(),
            comment().map(plain)
        )
    }
}

p! {
    code() -> Scanned<'a>, {
        recognize_with_value(
            inert().with(optional(element().and(code())))
        ).map(joined)
    }
}

p! {
    bash_code() -> crate::ast::BashCode<'a>, {
        code().map(|(text, vars)| crate::ast::BashCode {
            text,
            vars: vars.into_iter().collect(),
        })
    }
}
