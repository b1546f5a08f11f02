use std::{fs, path::Path};

use nvsim_params::{NandCell, ParamError, Value};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const CELL: &str = "\
# 3D NAND cell, 40nm pitch
[temperature]
TEMP = 300

[staircase]
STAIR_LENGTH = 0.5e-6
NUM_STAIRS = 17
TRENCH_WIDTH = 2e-6

[wordline]
Barrier_width = 3e-9
L_g = 30e-9
L_g_tr = 30e-9
L_spacer = 40e-9 - Barrier_width * 2

[channel]
r_f = 15e-9
t_si = 10e-9
r = r_f + t_si
t_1 = 6e-9
t_2 = 6e-9
t_3 = 5e-9
t_4 = 3e-9
t_ox = t_1 + t_2 + t_3 + t_4
W_f = 60e-9
H_f = 70e-9
W_g = 60e-9
H_g = 70e-9

[material]
epsilon_sio = 3.9 * permittivity
epsilon_si = 11.7 * permittivity
epsilon_sion = 5.5 * permittivity
epsilon_sin = 7.5 * permittivity
epsilon_alo = 9.0 * permittivity
Tungsten_Resistivity = 5e-7 * (1 + 0.0045 * (TEMP - 293))
Polysi_Resistivity = 1. / 3. * 1e-3
";

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn write_cell(&self, text: &str) -> std::path::PathBuf {
        let path = self.dir.path().join("cell.ini");
        fs::write(&path, text).unwrap();
        path
    }

    fn out_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("config")
    }
}

#[fixture]
fn workspace() -> Workspace {
    Workspace {
        dir: tempfile::tempdir().unwrap(),
    }
}

fn read_entries(path: &Path) -> Vec<(String, String)> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| {
            let (key, value) = l.split_once(": ").unwrap();
            (key.trim_start_matches('-').to_string(), value.to_string())
        })
        .collect()
}

fn entry(entries: &[(String, String)], key: &str) -> f64 {
    entries
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.parse().unwrap())
        .unwrap()
}

#[rstest]
fn test_writes_all_configuration_files(workspace: Workspace) {
    let config = workspace.write_cell(CELL);
    let written = NandCell::load(&config)
        .unwrap()
        .write_all(&workspace.out_dir())
        .unwrap();
    assert_eq!(written.len(), 6);
    for name in [
        "stringWire.cfg",
        "contactWire.cfg",
        "wordlineWire.cfg",
        "selectlineWire.cfg",
        "parasitic.cfg",
        "cellDimension.cfg",
    ] {
        assert!(workspace.out_dir().join(name).is_file(), "{} missing", name);
    }

    let parasitic = read_entries(&workspace.out_dir().join("parasitic.cfg"));
    for key in ["flCapGc", "flCapOfGex", "flCapOfGsd"] {
        assert!(entry(&parasitic, key) > 0.0, "{} should be positive", key);
    }
    assert_eq!(entry(&parasitic, "trCapGc"), entry(&parasitic, "flCapGc"));
}

#[rstest]
fn test_cell_height_stacks_spacer_gate_and_barriers(workspace: Workspace) {
    let config = workspace.write_cell(CELL);
    let cell = NandCell::load(&config).unwrap();
    cell.write_all(&workspace.out_dir()).unwrap();

    let dims = read_entries(&workspace.out_dir().join("cellDimension.cfg"));
    let l_spacer = 40e-9 - 3e-9 * 2.0;
    let expected = l_spacer + 30e-9 + 3e-9 * 2.0;
    assert_eq!(entry(&dims, "CellHeight (m)"), expected);
    assert_eq!(cell.get("CellHeight").unwrap(), Value::Float(expected));
    assert_eq!(entry(&dims, "CellLength (m)"), 70e-9 * 2.0);
    assert_eq!(entry(&dims, "CellWidth (m)"), 60e-9 * 2.0);
}

#[rstest]
fn test_output_uses_python_float_text(workspace: Workspace) {
    let config = workspace.write_cell(CELL);
    NandCell::load(&config)
        .unwrap()
        .write_all(&workspace.out_dir())
        .unwrap();
    let dims = fs::read_to_string(workspace.out_dir().join("cellDimension.cfg")).unwrap();
    assert_eq!(
        dims,
        "-CellLength (m): 1.4e-07\n\
         -CellWidth (m): 1.2e-07\n\
         -CellHeight (m): 6.999999999999999e-08\n\
         -NumStairs: 17\n\
         -StairLength: 5e-07\n\
         -TrenchWidth: 2e-06\n\
         -Temperature (K): 300\n"
    );
    let contact = fs::read_to_string(workspace.out_dir().join("contactWire.cfg")).unwrap();
    let tungsten = 5e-7 * (1.0 + 0.0045 * 7.0);
    let expected = tungsten / ((25e-9 * 25e-9) * std::f64::consts::PI);
    assert_eq!(
        contact,
        format!("-resWirePerUnit: {}\n", Value::Float(expected))
    );
}

#[rstest]
#[case("[wordline]\nL_g = 30e-9\n", "temperature")]
#[case(&CELL.replace("[material]", "[materials]"), "material")]
fn test_missing_sections_are_reported(
    workspace: Workspace,
    #[case] text: &str,
    #[case] section: &str,
) {
    let config = workspace.write_cell(text);
    assert!(matches!(
        NandCell::load(&config),
        Err(ParamError::MissingSection(s)) if s == section
    ));
}

#[rstest]
fn test_case_insensitive_keys(workspace: Workspace) {
    let config = workspace.write_cell(&CELL.replace("NUM_STAIRS = 17", "num_stairs = 16 + 1"));
    let cell = NandCell::load(&config).unwrap();
    assert_eq!(cell.get("NUM_STAIRS").unwrap(), Value::Int(17));
}

#[rstest]
fn test_zero_spacer_is_an_error_not_nan(workspace: Workspace) {
    let config =
        workspace.write_cell(&CELL.replace("L_spacer = 40e-9 - Barrier_width * 2", "L_spacer = 0"));
    match NandCell::load(&config) {
        Err(ParamError::Eval { key, source }) => {
            assert_eq!(key, "C_of_gsd2");
            assert!(matches!(*source, ParamError::ZeroDivision(_)));
        }
        other => panic!("expected a division error, got {:?}", other),
    }
    assert!(!workspace.out_dir().exists());
}

#[rstest]
fn test_thin_channel_cell(workspace: Workspace) {
    let text = CELL
        .replace("L_spacer = 40e-9 - Barrier_width * 2", "L_spacer = 3e-8")
        .replace("r_f = 15e-9", "r_f = 5e-9")
        .replace("t_si = 10e-9", "t_si = 2e-9")
        .replace("r = r_f + t_si", "r = 7e-9")
        .replace("t_1 = 6e-9", "t_1 = 2e-9")
        .replace("t_3 = 5e-9", "t_3 = 4e-9")
        .replace("t_4 = 3e-9", "t_4 = 2e-9")
        .replace("W_f = 60e-9", "W_f = 30e-9")
        .replace("H_f = 70e-9", "H_f = 35e-9");
    let config = workspace.write_cell(&text);
    let cell = NandCell::load(&config).unwrap();
    cell.write_all(&workspace.out_dir()).unwrap();

    let parasitic = fs::read_to_string(workspace.out_dir().join("parasitic.cfg")).unwrap();
    for line in parasitic.lines().filter(|l| !l.is_empty()) {
        let (key, value) = line.split_once(": ").unwrap();
        assert!(key.starts_with('-'), "{:?} lacks the option dash", line);
        let value: f64 = value.parse().unwrap();
        assert_eq!(line, format!("{}: {}", key, Value::Float(value)));
    }
    let parasitic = read_entries(&workspace.out_dir().join("parasitic.cfg"));
    for key in ["flCapGc", "flCapOfGex", "flCapOfGsd"] {
        assert!(entry(&parasitic, key) > 0.0, "{} should be positive", key);
    }

    let expected = 3e-8 + 30e-9 + 3e-9 * 2.0;
    let dims = fs::read_to_string(workspace.out_dir().join("cellDimension.cfg")).unwrap();
    assert!(dims.contains("-CellHeight (m): 6.6e-08\n"), "{}", dims);
    assert_eq!(cell.get("CellHeight").unwrap(), Value::Float(expected));
}
