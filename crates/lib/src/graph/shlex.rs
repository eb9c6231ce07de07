//! POSIX-style command line splitting.

/// Split a command line into words, honoring single quotes, double quotes and
/// backslash escapes.
///
/// Never fails: an unterminated quote runs to the end of the input.
pub fn shlex(line: &str) -> Vec<String> {
  let mut words = Vec::new();
  let mut current = String::new();
  let mut in_word = false;
  let mut chars = line.chars();

  while let Some(c) = chars.next() {
    match c {
      '\'' => {
        in_word = true;
        for q in chars.by_ref() {
          if q == '\'' {
            break;
          }
          current.push(q);
        }
      }
      '"' => {
        in_word = true;
        while let Some(q) = chars.next() {
          match q {
            '"' => break,
            '\\' => match chars.next() {
              Some(e @ ('"' | '\\' | '$' | '`')) => current.push(e),
              Some(e) => {
                current.push('\\');
                current.push(e);
              }
              None => current.push('\\'),
            },
            _ => current.push(q),
          }
        }
      }
      '\\' => {
        in_word = true;
        if let Some(e) = chars.next() {
          current.push(e);
        }
      }
      c if c.is_whitespace() => {
        if in_word {
          words.push(std::mem::take(&mut current));
          in_word = false;
        }
      }
      c => {
        in_word = true;
        current.push(c);
      }
    }
  }

  if in_word {
    words.push(current);
  }

  words
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn splits_on_whitespace() {
    assert_eq!(shlex("cmp -s  mnt/foo\tfoo2"), vec!["cmp", "-s", "mnt/foo", "foo2"]);
  }

  #[test]
  fn single_quotes_group_words() {
    assert_eq!(
      shlex("sh -c 'echo -n bar > foo2'"),
      vec!["sh", "-c", "echo -n bar > foo2"]
    );
  }

  #[test]
  fn double_quotes_allow_escapes() {
    assert_eq!(shlex(r#"echo "a \"b\" c""#), vec!["echo", r#"a "b" c"#]);
  }

  #[test]
  fn empty_quotes_make_empty_word() {
    assert_eq!(shlex("printf ''"), vec!["printf", ""]);
  }

  #[test]
  fn blank_line_has_no_words() {
    assert!(shlex("   ").is_empty());
  }
}
