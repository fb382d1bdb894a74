// main.rs
// Description: Interactive console front end: loads a run configuration and a text
//              corpus, trains the transformer on next token prediction, and answers
//              prompts by sampling a continuation.
// History:
// - 2026-03-03: Initial menu loop.
// - 2026-03-06: Run configuration from JSON with defaults fallback.
// Author: Marcus Schlieper

use std::io::{self, Write};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use micro_llm::layer::PositionalEncoding;
use micro_llm::model::{TransformerConfig, TransformerModel};
use micro_llm::tokenizer::{CharTokenizer, Tokenizer};
use micro_llm::train::{generate, Dataset, Trainer};

const S_CONFIG_PATH: &str = "run_config.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RunConfig {
    s_corpus_path: String,
    i_d_model: usize,
    i_num_heads: usize,
    i_d_ff: usize,
    i_num_layers: usize,
    i_max_seq_len: usize,
    i_epochs: usize,
    d_learning_rate: f64,
    d_temperature: f64,
    i_max_new_tokens: usize,
    u64_seed: u64,
    positional: PositionalEncoding,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            s_corpus_path: "corpus.json".to_string(),
            i_d_model: 64,
            i_num_heads: 4,
            i_d_ff: 128,
            i_num_layers: 2,
            i_max_seq_len: 64,
            i_epochs: 50,
            d_learning_rate: 0.01,
            d_temperature: 0.8,
            i_max_new_tokens: 48,
            u64_seed: 42,
            positional: PositionalEncoding::Sinusoidal,
        }
    }
}

fn load_run_config() -> RunConfig {
    match std::fs::read_to_string(S_CONFIG_PATH) {
        Ok(s_raw) => match serde_json::from_str(&s_raw) {
            Ok(cfg) => {
                println!("Loaded run configuration from {}", S_CONFIG_PATH);
                cfg
            }
            Err(e) => {
                eprintln!("run_config_parse_failed: {} ({}), using defaults", S_CONFIG_PATH, e);
                RunConfig::default()
            }
        },
        Err(_) => {
            println!("No {} found, using defaults", S_CONFIG_PATH);
            RunConfig::default()
        }
    }
}

fn load_dataset(run: &RunConfig) -> Dataset {
    match Dataset::from_json_file(&run.s_corpus_path) {
        Ok(ds) if !ds.is_empty() => {
            println!("Loaded {} corpus rows from {}", ds.len(), run.s_corpus_path);
            ds
        }
        Ok(_) | Err(_) => {
            println!(
                "Corpus {} missing or empty, using the built in demo corpus",
                run.s_corpus_path
            );
            Dataset::from_lines(vec![
                "the cat sat on the mat. ".to_string(),
                "the dog sat on the mat. ".to_string(),
                "the cat ran after the dog. ".to_string(),
                "the dog ran after the cat. ".to_string(),
            ])
        }
    }
}

fn read_line(s_prompt: &str) -> String {
    print!("{}", s_prompt);
    let _ = io::stdout().flush();
    let mut s_input = String::new();
    if io::stdin().read_line(&mut s_input).is_err() {
        return String::new();
    }
    s_input.trim().to_string()
}

struct Session {
    run: RunConfig,
    opt_state: Option<(TransformerModel, CharTokenizer)>,
    rng: StdRng,
}

impl Session {
    fn new(run: RunConfig) -> Self {
        let rng = StdRng::seed_from_u64(run.u64_seed);
        Self {
            run,
            opt_state: None,
            rng,
        }
    }

    fn train(&mut self) -> Result<(), String> {
        let ds = load_dataset(&self.run);
        let tokenizer = CharTokenizer::from_corpus(&ds.corpus_text());
        println!("Vocabulary size: {}", tokenizer.vocab_size());

        let config = TransformerConfig {
            i_vocab_size: tokenizer.vocab_size(),
            i_d_model: self.run.i_d_model,
            i_num_heads: self.run.i_num_heads,
            i_d_ff: self.run.i_d_ff,
            i_num_layers: self.run.i_num_layers,
            i_max_seq_len: self.run.i_max_seq_len,
            positional: self.run.positional,
        };

        let mut model = TransformerModel::new(config, &mut self.rng)?;
        println!("Model parameters: {}", model.num_parameters());

        let v_rows: Vec<Vec<usize>> = ds
            .tokenize(&tokenizer)?
            .into_iter()
            .map(|v_row| {
                if v_row.len() > self.run.i_max_seq_len {
                    v_row[..self.run.i_max_seq_len].to_vec()
                } else {
                    v_row
                }
            })
            .collect();

        let mut trainer = Trainer::new();
        trainer.train(&mut model, &v_rows, self.run.i_epochs, self.run.d_learning_rate)?;

        self.opt_state = Some((model, tokenizer));
        println!("Training finished.");
        Ok(())
    }

    fn ask(&mut self) -> Result<(), String> {
        let (model, tokenizer) = self
            .opt_state
            .as_ref()
            .ok_or_else(|| "no_trained_model: run training first".to_string())?;

        let s_prompt = read_line("Prompt> ");
        if s_prompt.is_empty() {
            return Err("generation_prompt_empty".to_string());
        }

        let s_out = generate(
            model,
            tokenizer,
            &s_prompt,
            self.run.i_max_new_tokens,
            self.run.d_temperature,
            &mut self.rng,
        )?;
        println!("{}", s_out);
        Ok(())
    }

    fn info(&self) {
        println!("Run configuration: {:?}", self.run);
        match &self.opt_state {
            Some((model, tokenizer)) => {
                println!("Model: {:?}", model.config());
                println!("Parameters: {}", model.num_parameters());
                println!("Vocabulary: {}", tokenizer.vocab_size());
            }
            None => println!("No trained model yet."),
        }
    }
}

fn main() {
    println!("micro-llm console");

    let mut session = Session::new(load_run_config());

    loop {
        println!();
        println!("[t] train   [a] ask   [i] info   [e] exit");
        let s_cmd = read_line("> ");

        let r = match s_cmd.as_str() {
            "t" => session.train(),
            "a" => session.ask(),
            "i" => {
                session.info();
                Ok(())
            }
            "e" => break,
            "" => Ok(()),
            s_other => Err(format!("unknown_command: {}", s_other)),
        };

        if let Err(s_err) = r {
            eprintln!("Error: {}", s_err);
        }
    }

    println!("Bye.");
}
