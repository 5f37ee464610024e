//! Deterministic decomposition of "2 sodas, 1 water" style messages into
//! `{quantity, name}` requests, so common orders skip the reasoning service.

use std::collections::HashMap;

use parley_core::domain::session::ItemRequest;
use parley_core::text::normalize;

const MAX_QUANTITY: u32 = 999;
const MAX_NAME_TOKENS: usize = 6;

const NUMBER_WORDS: &[(&str, u32)] = &[
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
    ("ten", 10),
    ("eleven", 11),
    ("twelve", 12),
    ("um", 1),
    ("uma", 1),
    ("dois", 2),
    ("duas", 2),
    ("tres", 3),
    ("quatro", 4),
    ("cinco", 5),
    ("seis", 6),
    ("sete", 7),
    ("oito", 8),
    ("nove", 9),
    ("dez", 10),
    ("onze", 11),
    ("doze", 12),
    ("uno", 1),
    ("una", 1),
    ("dos", 2),
    ("cuatro", 4),
    ("siete", 7),
    ("ocho", 8),
    ("nueve", 9),
    ("diez", 10),
    ("once", 11),
    ("doce", 12),
];

const UNIT_WORDS: &[&str] = &[
    "box", "boxes", "caixa", "caixas", "caja", "cajas", "pack", "packs", "pacote", "pacotes",
    "fardo", "fardos", "dozen", "dozens", "duzia", "duzias", "docena", "docenas", "case", "cases",
];

const CONJUNCTIONS: &[&str] = &["and", "e", "y", "plus", "mais"];

const LEADING_FILLER: &[&str] = &[
    "i", "want", "id", "like", "would", "please", "pls", "add", "send", "me", "give", "quero",
    "queria", "manda", "mande", "quiero", "dame", "also", "tambem", "mas",
];

const UNIT_FILLER: &[&str] = &["of", "de", "x"];

/// Parses `text` into item requests, or `None` when the message does not read
/// as a plain order list.
pub fn parse(text: &str) -> Option<Vec<ItemRequest>> {
    if text.contains('?') {
        return None;
    }

    let segments: Vec<Vec<String>> = raw_segments(text)
        .iter()
        .flat_map(|segment| split_on_conjunctions(&normalize(segment)))
        .filter(|tokens| !tokens.is_empty())
        .collect();
    if segments.is_empty() {
        return None;
    }

    let parsed: Vec<Option<ItemRequest>> =
        segments.iter().map(|tokens| parse_segment(tokens)).collect();

    let mut requests = Vec::with_capacity(parsed.len());
    for (index, request) in parsed.iter().enumerate() {
        match request {
            Some(request) => requests.push(request.clone()),
            None if index == 0 => {
                let quantity = dominant_quantity(&parsed[1..])?;
                let name = name_from(&segments[0])?;
                requests.push(ItemRequest { quantity, name, secondary_unit: false });
            }
            None => return None,
        }
    }
    Some(requests)
}

/// Splits on list punctuation and line breaks, dropping `[n]` batch labels.
fn raw_segments(text: &str) -> Vec<String> {
    text.lines()
        .map(strip_batch_label)
        .flat_map(|line| line.split([',', ';', '+']).map(str::to_owned).collect::<Vec<_>>())
        .map(|segment| segment.trim().to_owned())
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn strip_batch_label(line: &str) -> &str {
    let trimmed = line.trim_start();
    let Some(rest) = trimmed.strip_prefix('[') else {
        return trimmed;
    };
    match rest.split_once(']') {
        Some((label, remainder)) if label.chars().all(|ch| ch.is_ascii_digit()) => remainder,
        _ => trimmed,
    }
}

/// "2 sodas and 1 water" splits; "mac and cheese" does not, since a
/// conjunction only separates items when a quantity follows it.
fn split_on_conjunctions(normalized: &str) -> Vec<Vec<String>> {
    let tokens: Vec<&str> = normalized.split(' ').filter(|token| !token.is_empty()).collect();
    let mut segments = vec![Vec::new()];
    for (index, token) in tokens.iter().enumerate() {
        let splits = CONJUNCTIONS.contains(token)
            && tokens.get(index + 1).is_some_and(|next| quantity_token(next).is_some());
        if splits {
            segments.push(Vec::new());
        } else if let Some(current) = segments.last_mut() {
            current.push((*token).to_owned());
        }
    }
    segments
}

fn quantity_token(token: &str) -> Option<u32> {
    let digits = token.strip_suffix('x').unwrap_or(token);
    let value = if !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()) {
        digits.parse::<u32>().ok()?
    } else {
        NUMBER_WORDS.iter().find(|(word, _)| *word == token).map(|(_, value)| *value)?
    };
    (1..=MAX_QUANTITY).contains(&value).then_some(value)
}

fn strip_filler(tokens: &[String]) -> &[String] {
    let start = tokens
        .iter()
        .position(|token| !LEADING_FILLER.contains(&token.as_str()))
        .unwrap_or(tokens.len());
    &tokens[start..]
}

fn name_from(tokens: &[String]) -> Option<String> {
    let tokens = strip_filler(tokens);
    if tokens.is_empty() || tokens.len() > MAX_NAME_TOKENS {
        return None;
    }
    if tokens.iter().any(|token| quantity_token(token).is_some()) {
        return None;
    }
    Some(tokens.join(" "))
}

fn parse_segment(tokens: &[String]) -> Option<ItemRequest> {
    let tokens = strip_filler(tokens);
    let (first, rest) = tokens.split_first()?;

    let (quantity, mut rest) = match quantity_token(first) {
        Some(quantity) => (quantity, rest),
        None => trailing_quantity(tokens)?,
    };

    let mut secondary_unit = false;
    if let Some((unit, after)) = rest.split_first() {
        if UNIT_WORDS.contains(&unit.as_str()) {
            secondary_unit = true;
            rest = after;
        }
    }
    if let Some((filler, after)) = rest.split_first() {
        if UNIT_FILLER.contains(&filler.as_str()) {
            rest = after;
        }
    }

    let name = name_from(rest)?;
    Some(ItemRequest { quantity, name, secondary_unit })
}

/// "soda x 3" and "soda 3x".
fn trailing_quantity(tokens: &[String]) -> Option<(u32, &[String])> {
    let (last, body) = tokens.split_last()?;
    if let Some(quantity) = last.strip_prefix('x').and_then(quantity_token) {
        return Some((quantity, body));
    }
    match body.split_last() {
        Some((marker, name)) if marker == "x" => Some((quantity_token(last)?, name)),
        _ if last.ends_with('x') && last.len() > 1 => Some((quantity_token(last)?, body)),
        _ => None,
    }
}

/// Quantity shared by most of the other segments, when it repeats and no
/// other quantity ties with it.
fn dominant_quantity(others: &[Option<ItemRequest>]) -> Option<u32> {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for request in others {
        let request = request.as_ref()?;
        *counts.entry(request.quantity).or_default() += 1;
    }
    let (&quantity, &count) = counts.iter().max_by_key(|(_, count)| **count)?;
    let tied = counts.values().filter(|other| **other == count).count() > 1;
    (count >= 2 && !tied).then_some(quantity)
}
