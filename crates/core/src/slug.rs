const MAX_SLUG_LEN: usize = 60;

fn transliterate(c: char) -> Option<&'static str> {
    Some(match c {
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' | 'ё' | 'э' => "e",
        'ж' => "zh",
        'з' => "z",
        'и' => "i",
        'й' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "h",
        'ц' => "ts",
        'ч' => "ch",
        'ш' => "sh",
        'щ' => "shch",
        'ъ' | 'ь' => "",
        'ы' => "y",
        'ю' => "yu",
        'я' => "ya",
        _ => return None,
    })
}

/// Filename-safe slug: Cyrillic transliterated to Latin, lowercased,
/// anything else collapsed to single underscores, capped at 60 chars.
pub fn safe_slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_sep = true;

    for c in text.to_lowercase().chars() {
        if let Some(tr) = transliterate(c) {
            if !tr.is_empty() {
                out.push_str(tr);
                last_was_sep = false;
            }
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }

    let trimmed: String = out.trim_matches('_').chars().take(MAX_SLUG_LEN).collect();
    let trimmed = trimmed.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "item".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin_text_is_lowercased_and_joined() {
        assert_eq!(safe_slug("Cash Flow Statement"), "cash_flow_statement");
    }

    #[test]
    fn cyrillic_is_transliterated() {
        assert_eq!(safe_slug("Оценка ликвидности"), "otsenka_likvidnosti");
        assert_eq!(safe_slug("Учёт"), "uchet");
    }

    #[test]
    fn punctuation_collapses_to_single_underscore() {
        assert_eq!(safe_slug("ROI -- (return)  on investment!"), "roi_return_on_investment");
    }

    #[test]
    fn empty_and_symbolic_input_fall_back() {
        assert_eq!(safe_slug(""), "item");
        assert_eq!(safe_slug("!!! ---"), "item");
    }

    #[test]
    fn long_titles_are_capped() {
        let long = "a".repeat(200);
        assert_eq!(safe_slug(&long).len(), 60);
    }

    #[test]
    fn soft_signs_disappear() {
        assert_eq!(safe_slug("Рентабельность"), "rentabelnost");
    }
}
