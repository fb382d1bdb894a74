// tokenizer.rs
// Description: Token stream adapters for the model. The Tokenizer trait fixes the
//              contract (dense ids in [0, vocab_size), id 0 reserved for the unknown
//              token); CharTokenizer maps single characters, PairTokenizer learns
//              greedy adjacent pair merges over a corpus.
// History:
// - 2026-03-02: Character tokenizer with reserved unknown id.
// - 2026-03-05: Pair merge tokenizer with deterministic tie breaking.
// Author: Marcus Schlieper

use std::collections::{BTreeSet, HashMap};

pub const S_UNK: &str = "<unk>";
pub const I_UNK_ID: usize = 0;

pub trait Tokenizer {
    fn vocab_size(&self) -> usize;
    fn text_to_tokens(&self, s_text: &str) -> Result<Vec<usize>, String>;
    fn tokens_to_text(&self, v_tokens: &[usize]) -> Result<String, String>;
}

fn render_tokens(v_vocab: &[String], v_tokens: &[usize]) -> Result<String, String> {
    let mut s_out = String::new();
    for (i_pos, &i_id) in v_tokens.iter().enumerate() {
        if i_id >= v_vocab.len() {
            return Err(format!(
                "token_id_out_of_range: pos={} id={} vocab_size={}",
                i_pos,
                i_id,
                v_vocab.len()
            ));
        }
        s_out.push_str(&v_vocab[i_id]);
    }
    Ok(s_out)
}

// ----------------------------------------
// CharTokenizer
// ----------------------------------------

// One id per distinct character of the corpus, assigned in sorted character
// order so the same corpus always yields the same vocabulary.
pub struct CharTokenizer {
    v_vocab: Vec<String>,
    m_char_to_id: HashMap<char, usize>,
}

impl CharTokenizer {
    pub fn from_corpus(s_corpus: &str) -> Self {
        let set_chars: BTreeSet<char> = s_corpus.chars().collect();

        let mut v_vocab = vec![S_UNK.to_string()];
        let mut m_char_to_id = HashMap::new();

        for c in set_chars {
            m_char_to_id.insert(c, v_vocab.len());
            v_vocab.push(c.to_string());
        }

        Self {
            v_vocab,
            m_char_to_id,
        }
    }
}

impl Tokenizer for CharTokenizer {
    fn vocab_size(&self) -> usize {
        self.v_vocab.len()
    }

    fn text_to_tokens(&self, s_text: &str) -> Result<Vec<usize>, String> {
        Ok(s_text
            .chars()
            .map(|c| *self.m_char_to_id.get(&c).unwrap_or(&I_UNK_ID))
            .collect())
    }

    fn tokens_to_text(&self, v_tokens: &[usize]) -> Result<String, String> {
        render_tokens(&self.v_vocab, v_tokens)
    }
}

// ----------------------------------------
// PairTokenizer
// ----------------------------------------

// Byte-pair style subword tokenizer: starts from the character vocabulary
// and repeatedly merges the most frequent adjacent symbol pair. Ties break
// on the lexicographically smallest merged string so training order is
// deterministic.
pub struct PairTokenizer {
    v_vocab: Vec<String>,
    m_token_to_id: HashMap<String, usize>,
    v_merges: Vec<(String, String)>,
}

impl PairTokenizer {
    pub fn train(s_corpus: &str, i_num_merges: usize) -> Self {
        let mut v_vocab = vec![S_UNK.to_string()];
        let mut m_token_to_id: HashMap<String, usize> = HashMap::new();

        let set_chars: BTreeSet<char> = s_corpus.chars().collect();
        for c in set_chars {
            m_token_to_id.insert(c.to_string(), v_vocab.len());
            v_vocab.push(c.to_string());
        }

        let mut v_symbols: Vec<String> = s_corpus.chars().map(|c| c.to_string()).collect();
        let mut v_merges: Vec<(String, String)> = Vec::new();

        for _ in 0..i_num_merges {
            let mut m_counts: HashMap<(String, String), usize> = HashMap::new();
            for w in v_symbols.windows(2) {
                *m_counts
                    .entry((w[0].clone(), w[1].clone()))
                    .or_insert(0) += 1;
            }

            let opt_best = m_counts.into_iter().max_by(|(pair_a, i_a), (pair_b, i_b)| {
                let s_a = format!("{}{}", pair_a.0, pair_a.1);
                let s_b = format!("{}{}", pair_b.0, pair_b.1);
                // Higher count wins; on equal counts the smaller merged
                // string wins, hence the reversed string comparison.
                i_a.cmp(i_b).then_with(|| s_b.cmp(&s_a))
            });

            let (pair, i_count) = match opt_best {
                Some(x) => x,
                None => break,
            };
            if i_count < 2 {
                break;
            }

            let s_merged = format!("{}{}", pair.0, pair.1);
            if !m_token_to_id.contains_key(&s_merged) {
                m_token_to_id.insert(s_merged.clone(), v_vocab.len());
                v_vocab.push(s_merged.clone());
            }

            v_symbols = Self::apply_merge(&v_symbols, &pair);
            v_merges.push(pair);
        }

        Self {
            v_vocab,
            m_token_to_id,
            v_merges,
        }
    }

    fn apply_merge(v_symbols: &[String], pair: &(String, String)) -> Vec<String> {
        let mut v_out: Vec<String> = Vec::with_capacity(v_symbols.len());
        let mut i = 0;
        while i < v_symbols.len() {
            if i + 1 < v_symbols.len() && v_symbols[i] == pair.0 && v_symbols[i + 1] == pair.1 {
                v_out.push(format!("{}{}", pair.0, pair.1));
                i += 2;
            } else {
                v_out.push(v_symbols[i].clone());
                i += 1;
            }
        }
        v_out
    }
}

impl Tokenizer for PairTokenizer {
    fn vocab_size(&self) -> usize {
        self.v_vocab.len()
    }

    fn text_to_tokens(&self, s_text: &str) -> Result<Vec<usize>, String> {
        let mut v_symbols: Vec<String> = s_text.chars().map(|c| c.to_string()).collect();

        // Merges replay in training order.
        for pair in &self.v_merges {
            v_symbols = Self::apply_merge(&v_symbols, pair);
        }

        Ok(v_symbols
            .iter()
            .map(|s| *self.m_token_to_id.get(s).unwrap_or(&I_UNK_ID))
            .collect())
    }

    fn tokens_to_text(&self, v_tokens: &[usize]) -> Result<String, String> {
        render_tokens(&self.v_vocab, v_tokens)
    }
}
