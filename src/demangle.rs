use cpp_demangle::{BorrowedSymbol, DemangleOptions, ParseOptions};

// Symbol demangling, in-process. Itanium C++ names via cpp_demangle, Rust v0
// names via rustc_demangle (legacy Rust names are Itanium-mangled and fall
// into the first case). Anything unrecognized passes through unchanged.

pub fn demangle(name: &str) -> String {
    if name.starts_with("_R") {
        return rustc_demangle::demangle(name).to_string();
    }
    if name.starts_with("_Z") || name.starts_with("__Z") {
        if let Ok(symbol) = BorrowedSymbol::new_with_options(name.as_bytes(), &ParseOptions::default().recursion_limit(1000)) {
            if let Ok(demangled) = symbol.demangle(&DemangleOptions::new().recursion_limit(1000)) {
                return demangled;
            }
        }
    }
    name.to_string()
}

// Demangled C++ names can get really long because they include all the
// parameter types. This strips the parameter list: drop a trailing " const",
// then remove the balanced top-level parenthesized group at the end, scanning
// right to left. Causes ambiguity for overloads, which is the point of having
// both cppsymbols and cppxsyms.
//
// Heuristic and inexact by nature.
pub fn strip_name(name: &str) -> &str {
    let name = name.strip_suffix(" const").unwrap_or(name);

    if !name.ends_with(')') {
        // Doesn't look like a function.
        return name;
    }

    let bytes = name.as_bytes();
    let mut nesting = 0i64;
    for n in (0..bytes.len()).rev() {
        match bytes[n] {
            b'(' => {
                nesting -= 1;
                if nesting == 0 {
                    return &name[..n];
                }
            }
            b')' => nesting += 1,
            _ => (),
        }
    }

    name
}

#[cfg(test)]
mod tests {
    use crate::demangle::*;

    #[test]
    fn strip_parameter_lists() {
        assert_eq!(strip_name("foo()"), "foo");
        assert_eq!(strip_name("foo(int, char)"), "foo");
        assert_eq!(strip_name("foo(void (*)(int))"), "foo");
        assert_eq!(strip_name("ns::Type::method(std::vector<int, std::allocator<int> > const&) const"), "ns::Type::method");
        assert_eq!(strip_name("operator()(int)"), "operator()");
        assert_eq!(strip_name("vtable for Foo"), "vtable for Foo");
        assert_eq!(strip_name("plain_data"), "plain_data");
        assert_eq!(strip_name(""), "");
    }

    #[test]
    fn demangles_itanium() {
        assert_eq!(demangle("_Z3fooi"), "foo(int)");
        assert_eq!(demangle("not_mangled"), "not_mangled");
    }

    #[test]
    fn demangles_rust_v0() {
        assert_eq!(demangle("_RNvC7mycrate3foo"), "mycrate::foo");
    }
}
